//! Log sinks threaded through the pipeline call chain.

use std::sync::{Mutex, PoisonError};

/// Receives pipeline log lines in emission order.
pub trait ProgressSink: Send + Sync {
    /// Records one log line.
    fn log(&self, line: &str);
}

/// Buffers every line for synchronous callers.
#[derive(Debug, Default)]
pub struct BufferSink {
    lines: Mutex<Vec<String>>,
}

impl BufferSink {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of the buffered lines.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Consumes the sink and returns the buffered lines.
    #[must_use]
    pub fn into_lines(self) -> Vec<String> {
        self.lines
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl ProgressSink for BufferSink {
    fn log(&self, line: &str) {
        tracing::info!(target: "skiff::progress", "{line}");
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.to_owned());
    }
}

/// Discards lines; used where only the outcome matters.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn log(&self, _line: &str) {}
}
