pub mod config;
pub mod diagnostics;
pub mod error;
pub mod headers;
pub mod locate;
pub mod milter;
pub mod pipeline;
pub mod scanner;
pub mod score;

#[cfg(all(test, unix))]
mod test_support;

pub use config::ScanSettings;
pub use diagnostics::{LogSink, RunLog, Severity};
pub use error::FilterError;
pub use milter::Milter;
pub use pipeline::{Filtered, MessageFilter, MessagePipeline};
pub use score::ScanResult;
