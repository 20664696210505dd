//! Run log sink.
//!
//! Lines written through a [`RunLog`] go to `tracing` and, when a sink is attached,
//! to whoever renders the run (the runner forwards them as progress events).

use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Receives human-readable log lines for a run.
pub trait LogSink: Send + Sync {
    /// Accepts one line.
    fn line(&self, line: &str);
}

/// Logging handle passed to operations through the context.
#[derive(Clone, Default)]
pub struct RunLog {
    run_id: String,
    sink: Option<Arc<dyn LogSink>>,
}

impl fmt::Debug for RunLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLog")
            .field("run_id", &self.run_id)
            .field("sink", &if self.sink.is_some() { "Some" } else { "None" })
            .finish()
    }
}

impl RunLog {
    /// Creates a log for the given run that forwards lines to `sink`.
    #[must_use]
    pub fn new(run_id: impl Into<String>, sink: Arc<dyn LogSink>) -> Self {
        Self { run_id: run_id.into(), sink: Some(sink) }
    }

    /// Creates a log that only writes to `tracing`.
    #[must_use]
    pub fn detached(run_id: impl Into<String>) -> Self {
        Self { run_id: run_id.into(), sink: None }
    }

    /// The run this log belongs to.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Writes an informational line.
    pub fn info(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        info!(run_id = %self.run_id, "{}", line);
        self.forward(line);
    }

    /// Writes a warning line.
    pub fn warn(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        warn!(run_id = %self.run_id, "{}", line);
        self.forward(line);
    }

    fn forward(&self, line: &str) {
        if let Some(sink) = &self.sink {
            sink.line(line);
        }
    }
}
