//! Per-message filtering pipeline.
//!
//! A run strips the configured number of `Received:` headers, pipes the
//! message through the scanner and flags it for discard when the returned
//! score reaches the threshold. Any failure along the way delivers the
//! original message unchanged.

use crate::config::ScanSettings;
use crate::diagnostics::{LogSink, RunLog};
use crate::error::FilterError;
use crate::headers::{skip_headers, MessageBuffer, RECEIVED_MARKER};
use crate::scanner::Scanner;
use crate::score::{apply_verdict, ScanResult};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

/// Boxed future returned by [`MessageFilter::process`].
pub type FilterFuture<'a> = Pin<Box<dyn Future<Output = Vec<u8>> + Send + 'a>>;

/// Contract between a delivery front end and the filter.
///
/// `process` always yields a message to deliver; it never rejects.
pub trait MessageFilter: Send + Sync {
    fn process<'a>(&'a self, raw: Vec<u8>) -> FilterFuture<'a>;

    fn name(&self) -> &str;
}

/// Result of one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct Filtered {
    pub message: Vec<u8>,
    pub result: ScanResult,
    /// The original bytes were returned because the run could not complete.
    pub passed_through: bool,
}

impl Filtered {
    fn passthrough(message: Vec<u8>) -> Self {
        Filtered {
            message,
            result: ScanResult::Unscored,
            passed_through: true,
        }
    }
}

#[derive(Clone)]
pub struct MessagePipeline {
    settings: Arc<ScanSettings>,
    sink: Arc<dyn LogSink>,
}

impl MessagePipeline {
    pub fn new(settings: Arc<ScanSettings>, sink: Arc<dyn LogSink>) -> Self {
        MessagePipeline { settings, sink }
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    fn run_log(&self) -> RunLog {
        RunLog::new(self.sink.clone(), self.settings.log_severity())
    }

    /// Filters one message. Never fails: on any error, including a panic
    /// inside the run, the original bytes come back.
    pub async fn filter(&self, raw: Vec<u8>) -> Filtered {
        let raw: Arc<[u8]> = raw.into();
        let pipeline = self.clone();
        let input = raw.clone();
        let unflushed = Arc::new(Mutex::new(Vec::new()));
        let run_log = self.run_log().divert_unflushed(unflushed.clone());

        match tokio::spawn(async move { pipeline.run(input, run_log).await }).await {
            Ok(filtered) => filtered,
            Err(e) => {
                let mut log = self.run_log();
                log.absorb(std::mem::take(
                    &mut *unflushed.lock().unwrap_or_else(|e| e.into_inner()),
                ));
                log.fatal("Exception detected");
                log.fatal(format!("Message run failed: {e}"));
                log.flush();
                Filtered::passthrough(raw.to_vec())
            }
        }
    }

    async fn run(&self, raw: Arc<[u8]>, mut log: RunLog) -> Filtered {
        log.debug("Message filter called");

        let filtered = match self.scan(&raw, &mut log).await {
            Ok((message, result)) => {
                log.debug(format!("Returning filtered message. BYTES={}", message.len()));
                Filtered {
                    message,
                    result,
                    passed_through: false,
                }
            }
            Err(e) => {
                log.log(format!("{e}. Bypassing."), e.severity());
                Filtered::passthrough(raw.to_vec())
            }
        };

        log.flush();
        filtered
    }

    async fn scan(
        &self,
        raw: &[u8],
        log: &mut RunLog,
    ) -> Result<(MessageBuffer, ScanResult), FilterError> {
        let settings = &self.settings;
        if !settings.scanner_exists() {
            return Err(FilterError::ScannerMissing(settings.scanner_path.clone()));
        }
        if raw.len() as u64 > settings.max_message_size {
            return Err(FilterError::Oversized {
                size: raw.len(),
                max: settings.max_message_size,
            });
        }

        let mut message: MessageBuffer = raw.to_vec();
        log.debug(format!("Message stream retrieved. BYTES={}", message.len()));
        skip_headers(
            &mut message,
            RECEIVED_MARKER,
            settings.skip_received_headers,
            log,
        );

        let output = Scanner::from_settings(settings)
            .exchange(message, log)
            .await?;
        if output.stdout.is_empty() {
            return Err(FilterError::EmptyOutput);
        }

        let mut annotated = output.stdout;
        let result = apply_verdict(&mut annotated, settings.reject_threshold, log);
        Ok((annotated, result))
    }
}

impl MessageFilter for MessagePipeline {
    fn process<'a>(&'a self, raw: Vec<u8>) -> FilterFuture<'a> {
        Box::pin(async move { self.filter(raw).await.message })
    }

    fn name(&self) -> &str {
        "spamc"
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::diagnostics::{MemoryLogSink, Severity};
    use crate::test_support::{write_script, SPAWN_LOCK};
    use std::path::Path;

    const MESSAGE: &[u8] = b"Received: from relay.example\n by mx.example with ESMTP\nReceived: from origin.example\nSubject: Offer\n\nBuy now\n";

    fn pipeline(scanner: &Path, tweak: impl FnOnce(&mut ScanSettings)) -> (Arc<MemoryLogSink>, MessagePipeline) {
        let mut settings = ScanSettings {
            scanner_path: scanner.to_path_buf(),
            log_level: Severity::Debug.code(),
            ..Default::default()
        };
        tweak(&mut settings);
        let sink = Arc::new(MemoryLogSink::new());
        (sink.clone(), MessagePipeline::new(Arc::new(settings), sink))
    }

    #[tokio::test]
    async fn test_end_to_end_flags_spam() {
        let _guard = SPAWN_LOCK.lock().await;
        let dir = tempfile::tempdir().unwrap();
        let scanner = write_script(dir.path(), "spamc", "cat\nprintf 'X-Spam-Score: 15\\n'");
        let (sink, pipeline) = pipeline(&scanner, |s| s.skip_received_headers = 1);

        let filtered = pipeline.filter(MESSAGE.to_vec()).await;
        assert!(!filtered.passed_through);
        assert_eq!(filtered.result, ScanResult::Flagged { score: 15.0 });
        assert_eq!(
            filtered.message,
            b"Received: from origin.example\nSubject: Offer\n\nBuy now\nX-Spam-Discard: YES\nX-Spam-Score: 15\n".to_vec()
        );
        assert_eq!(sink.batches(), 1);
    }

    #[tokio::test]
    async fn test_low_score_returns_scanner_output() {
        let _guard = SPAWN_LOCK.lock().await;
        let dir = tempfile::tempdir().unwrap();
        let scanner = write_script(dir.path(), "spamc", "printf 'X-Spam-Score: 2.1\\n'\ncat");
        let (_, pipeline) = pipeline(&scanner, |_| {});

        let filtered = pipeline.filter(MESSAGE.to_vec()).await;
        assert_eq!(filtered.result, ScanResult::Passed { score: 2.1 });
        let mut expected = b"X-Spam-Score: 2.1\n".to_vec();
        expected.extend_from_slice(MESSAGE);
        assert_eq!(filtered.message, expected);
    }

    #[tokio::test]
    async fn test_missing_scanner_passes_through() {
        let (sink, pipeline) = pipeline(Path::new("/nonexistent/spamc"), |s| {
            s.skip_received_headers = 1;
            s.log_level = Severity::Fatal.code();
        });

        let filtered = pipeline.filter(MESSAGE.to_vec()).await;
        assert!(filtered.passed_through);
        assert_eq!(filtered.message, MESSAGE);
        assert!(sink.contains(Severity::Fatal, "/nonexistent/spamc"));
        assert_eq!(sink.batches(), 1);
    }

    #[tokio::test]
    async fn test_oversized_message_is_not_scanned() {
        let _guard = SPAWN_LOCK.lock().await;
        let dir = tempfile::tempdir().unwrap();
        let scanner = write_script(dir.path(), "spamc", "cat\nprintf 'X-Spam-Score: 50\\n'");
        let (sink, pipeline) = pipeline(&scanner, |s| s.max_message_size = 16);

        let filtered = pipeline.filter(MESSAGE.to_vec()).await;
        assert!(filtered.passed_through);
        assert_eq!(filtered.message, MESSAGE);
        assert!(sink.contains(Severity::Warning, "too large"));
    }

    #[tokio::test]
    async fn test_timeout_passes_through() {
        let _guard = SPAWN_LOCK.lock().await;
        let dir = tempfile::tempdir().unwrap();
        let scanner = write_script(dir.path(), "spamc", "exec sleep 10");
        let (sink, pipeline) = pipeline(&scanner, |s| s.scan_timeout_secs = 1);

        let filtered = pipeline.filter(MESSAGE.to_vec()).await;
        assert!(filtered.passed_through);
        assert_eq!(filtered.message, MESSAGE);
        assert!(sink.contains(Severity::Error, "did not finish"));
    }

    #[tokio::test]
    async fn test_scanner_failure_still_uses_output() {
        let _guard = SPAWN_LOCK.lock().await;
        let dir = tempfile::tempdir().unwrap();
        let scanner = write_script(
            dir.path(),
            "spamc",
            "cat\nprintf 'X-Spam-Score: 11\\n'\necho 'partial failure' >&2\nexit 1",
        );
        let (sink, pipeline) = pipeline(&scanner, |_| {});

        let filtered = pipeline.filter(MESSAGE.to_vec()).await;
        assert!(filtered.result.flagged());
        assert!(!filtered.passed_through);
        assert!(sink.contains(Severity::Error, "partial failure"));
    }

    #[tokio::test]
    async fn test_empty_output_passes_through() {
        let _guard = SPAWN_LOCK.lock().await;
        let dir = tempfile::tempdir().unwrap();
        let scanner = write_script(dir.path(), "spamc", "cat >/dev/null");
        let (_, pipeline) = pipeline(&scanner, |_| {});

        let filtered = pipeline.filter(MESSAGE.to_vec()).await;
        assert!(filtered.passed_through);
        assert_eq!(filtered.message, MESSAGE);
    }

    #[tokio::test]
    async fn test_unparseable_score_keeps_scanner_output() {
        let _guard = SPAWN_LOCK.lock().await;
        let dir = tempfile::tempdir().unwrap();
        let scanner = write_script(dir.path(), "spamc", "cat\nprintf 'X-Spam-Score: ??\\n'");
        let (sink, pipeline) = pipeline(&scanner, |_| {});

        let filtered = pipeline.filter(MESSAGE.to_vec()).await;
        let mut expected = MESSAGE.to_vec();
        expected.extend_from_slice(b"X-Spam-Score: ??\n");
        assert_eq!(filtered.message, expected);
        assert_eq!(filtered.result, ScanResult::Unscored);
        assert!(sink.contains(Severity::Warning, "Could not parse score"));
    }

    #[tokio::test]
    async fn test_score_does_not_carry_over() {
        let _guard = SPAWN_LOCK.lock().await;
        let dir = tempfile::tempdir().unwrap();
        // Scores only messages that mention "spam".
        let scanner = write_script(
            dir.path(),
            "spamc",
            "input=$(cat)\nprintf '%s\\n' \"$input\"\ncase \"$input\" in *spam*) printf 'X-Spam-Score: 30\\n' ;; esac",
        );
        let (_, pipeline) = pipeline(&scanner, |_| {});

        let first = pipeline.filter(b"Subject: spam\n\nx\n".to_vec()).await;
        assert!(first.result.flagged());

        let second = pipeline.filter(b"Subject: hello\n\nx\n".to_vec()).await;
        assert_eq!(second.result, ScanResult::Unscored);
        assert_eq!(second.message, b"Subject: hello\n\nx\n".to_vec());
    }

    #[tokio::test]
    async fn test_concurrent_runs() {
        let _guard = SPAWN_LOCK.lock().await;
        let dir = tempfile::tempdir().unwrap();
        let scanner = write_script(dir.path(), "spamc", "cat\nprintf 'X-Spam-Score: 12\\n'");
        let (sink, pipeline) = pipeline(&scanner, |s| s.skip_received_headers = 2);

        let mut runs = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let pipeline = pipeline.clone();
            runs.spawn(async move { pipeline.process(MESSAGE.to_vec()).await });
        }
        while let Some(message) = runs.join_next().await {
            assert_eq!(
                message.unwrap(),
                b"Subject: Offer\n\nBuy now\nX-Spam-Discard: YES\nX-Spam-Score: 12\n".to_vec()
            );
        }
        assert_eq!(sink.batches(), 8);
    }
}
