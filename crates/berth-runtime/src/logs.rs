//! Mirrors runtime progress output into `tracing`.

use std::io::Write;

/// A line-buffered writer that emits each complete line as a tracing event.
///
/// Attach one to a [`FanOut`](crate::fanout::FanOut) to surface pull and
/// build progress in the process log.
#[derive(Debug)]
pub struct TracingWriter {
    label: String,
    pending: Vec<u8>,
}

impl TracingWriter {
    /// Creates a writer whose events carry `label` as the `image` field.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            pending: Vec::new(),
        }
    }

    fn emit(&self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        let text = text.trim_end_matches('\r');
        if !text.trim().is_empty() {
            tracing::info!(image = %self.label, "{text}");
        }
    }
}

impl Write for TracingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.pending.extend_from_slice(buf);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.emit(&line[..line.len() - 1]);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.emit(&line);
        }
        Ok(())
    }
}

impl Drop for TracingWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_partial_lines() {
        let mut w = TracingWriter::new("app:latest");
        w.write_all(b"Step 1/2 : FROM alp").expect("write");
        assert_eq!(w.pending, b"Step 1/2 : FROM alp");
        w.write_all(b"ine\nStep 2/2").expect("write");
        assert_eq!(w.pending, b"Step 2/2");
        w.flush().expect("flush");
        assert!(w.pending.is_empty());
    }
}
