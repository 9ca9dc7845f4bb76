//! Fan-out output sink.
//!
//! Image jobs write pull and build progress once; every attached observer
//! receives a copy. Observers come and go while writes are in flight.

use std::io::Write;
use std::sync::{Mutex, MutexGuard, PoisonError};

type Observer = Box<dyn Write + Send>;

#[derive(Default)]
struct Observers {
    next_id: u64,
    entries: Vec<(u64, Observer)>,
}

/// A writer that copies everything to a dynamic set of observers.
#[derive(Default)]
pub struct FanOut {
    observers: Mutex<Observers>,
}

impl std::fmt::Debug for FanOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOut")
            .field("observers", &self.lock().entries.len())
            .finish()
    }
}

/// Detaches its observer from the sink when dropped.
#[must_use = "the observer is detached as soon as the guard is dropped"]
pub struct Attachment<'a> {
    sink: &'a FanOut,
    id: u64,
}

impl Drop for Attachment<'_> {
    fn drop(&mut self) {
        self.sink.detach(self.id);
    }
}

impl FanOut {
    /// Creates a sink with no observers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Observers> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds an observer for as long as the returned guard lives.
    pub fn attach(&self, observer: Observer) -> Attachment<'_> {
        let id = self.attach_detached(observer);
        Attachment { sink: self, id }
    }

    /// Adds an observer for the lifetime of the sink and returns its ID.
    pub fn attach_detached(&self, observer: Observer) -> u64 {
        let mut observers = self.lock();
        let id = observers.next_id;
        observers.next_id += 1;
        observers.entries.push((id, observer));
        id
    }

    /// Removes an observer, flushing it first.
    pub fn detach(&self, id: u64) {
        let mut observers = self.lock();
        if let Some(pos) = observers.entries.iter().position(|(i, _)| *i == id) {
            let (_, mut observer) = observers.entries.remove(pos);
            let _ = observer.flush();
        }
    }

    /// Returns the number of attached observers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns whether no observer is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies `data` to every observer.
    ///
    /// A failing observer is skipped; the others still receive the data.
    pub fn write_bytes(&self, data: &[u8]) {
        let mut observers = self.lock();
        for (id, observer) in &mut observers.entries {
            if let Err(e) = observer.write_all(data) {
                tracing::trace!(observer = *id, error = %e, "observer write failed");
            }
        }
    }

    /// Writes `line` followed by a newline, unless it already ends in one.
    pub fn write_line(&self, line: &str) {
        if line.ends_with('\n') {
            self.write_bytes(line.as_bytes());
        } else {
            self.write_bytes(format!("{line}\n").as_bytes());
        }
    }

    /// Flushes every observer, ignoring failures.
    pub fn flush_all(&self) {
        for (_, observer) in &mut self.lock().entries {
            let _ = observer.flush();
        }
    }
}

impl Write for &FanOut {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write_bytes(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.flush_all();
        Ok(())
    }
}
