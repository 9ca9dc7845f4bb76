//! Job completion signals and the concurrent job runner.
//!
//! Jobs are not scheduled in dependency order. Every job starts at once and
//! a dependent simply awaits the [`Completion`] of the job it needs.

use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use berth_common::error::{BerthError, JobResult, SharedError};
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// An observer a waiter hands to a job to tail its progress output.
pub type Observer = Box<dyn Write + Send>;

/// A one-shot outcome that any number of tasks can await.
#[derive(Debug)]
pub struct Completion<T> {
    tx: watch::Sender<Option<JobResult<T>>>,
}

impl<T: Clone> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Completion<T> {
    /// Creates an unfired signal.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Fires the signal. Only the first call has any effect; returns whether
    /// this call was it.
    pub fn finish(&self, outcome: JobResult<T>) -> bool {
        let mut outcome = Some(outcome);
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = outcome.take();
            true
        })
    }

    /// Returns whether the signal has fired.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Waits for the signal and returns a copy of the outcome.
    ///
    /// # Errors
    ///
    /// Returns the shared error the job finished with.
    pub async fn wait(&self) -> JobResult<T> {
        let mut rx = self.tx.subscribe();
        let fired = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|e| Arc::new(BerthError::runtime(e)))?;
        match &*fired {
            Some(outcome) => outcome.clone(),
            None => Err(Arc::new(BerthError::runtime("job completion lost"))),
        }
    }
}

/// One unit of setup work.
#[async_trait]
pub trait SetupJob: Send + Sync {
    /// What the job provisions, for logs.
    fn kind(&self) -> &'static str;

    /// Name of the provisioned entity.
    fn name(&self) -> &str;

    /// Runs the job to completion and fires its completion signal.
    ///
    /// # Errors
    ///
    /// Returns the error the job failed with; waiters receive the same one.
    async fn execute(&self) -> JobResult<()>;

    /// Waits for [`execute`](Self::execute) to finish. `observer`, when
    /// given, receives whatever progress the job reports meanwhile.
    ///
    /// # Errors
    ///
    /// Returns the error the job failed with.
    async fn wait(&self, observer: Option<Observer>) -> JobResult<()>;

    /// Fires the completion signal with `error` if it has not fired yet.
    fn abandon(&self, error: SharedError);
}

/// Runs every job concurrently and waits for all of them.
///
/// Each failure is logged. The first one to be observed is returned after
/// the last job has finished; a panicking job counts as a failure.
///
/// # Errors
///
/// Returns the first job error observed.
pub async fn run_all(jobs: Vec<Arc<dyn SetupJob>>) -> JobResult<()> {
    let mut tasks = JoinSet::new();
    for job in jobs {
        let _ = tasks.spawn(async move {
            let outcome = match AssertUnwindSafe(job.execute()).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let error = Arc::new(BerthError::runtime(format!(
                        "{} {} panicked",
                        job.kind(),
                        job.name()
                    )));
                    job.abandon(Arc::clone(&error));
                    Err(error)
                }
            };
            (job, outcome)
        });
    }

    let mut first: Option<SharedError> = None;
    while let Some(joined) = tasks.join_next().await {
        let (job, outcome) = match joined {
            Ok(done) => done,
            Err(e) => {
                tracing::error!(error = %e, "setup task failed");
                let _ = first.get_or_insert_with(|| Arc::new(BerthError::runtime(e)));
                continue;
            }
        };
        match outcome {
            Ok(()) => tracing::debug!(kind = job.kind(), name = job.name(), "setup job finished"),
            Err(e) => {
                tracing::error!(kind = job.kind(), name = job.name(), error = %e, "setup job failed");
                let _ = first.get_or_insert(e);
            }
        }
    }
    first.map_or(Ok(()), Err)
}
