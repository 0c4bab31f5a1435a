//! Error types for the message pipeline.

use std::path::PathBuf;
use std::time::Duration;

use crate::diagnostics::Severity;

/// Reasons a pipeline run gives up and passes the original message through.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("Scanner does not exist at path: '{}'", .0.display())]
    ScannerMissing(PathBuf),

    #[error("Message is too large. Increase max_message_size to scan larger messages. MAXSIZE={max}, MESSAGESIZE={size}")]
    Oversized { size: usize, max: u64 },

    #[error("Failed to start scanner: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Scanner I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Scanner did not finish within {0:?}")]
    ScannerTimeout(Duration),

    #[error("Scanner produced no output")]
    EmptyOutput,

    #[error("Message processing aborted: {0}")]
    Aborted(String),
}

impl FilterError {
    /// Log level the failure is reported at.
    pub fn severity(&self) -> Severity {
        match self {
            FilterError::ScannerMissing(_) | FilterError::Aborted(_) => Severity::Fatal,
            FilterError::Oversized { .. } => Severity::Warning,
            FilterError::Spawn(_)
            | FilterError::Io(_)
            | FilterError::ScannerTimeout(_)
            | FilterError::EmptyOutput => Severity::Error,
        }
    }
}
