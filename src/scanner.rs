//! External content scanner invocation.
//!
//! The scanner reads a message on stdin and writes the annotated message to
//! stdout. Input is fed from a separate task while stdout and stderr are
//! drained, so a scanner that starts answering before it has consumed the
//! whole message cannot fill a pipe and stall both sides.

use crate::config::ScanSettings;
use crate::diagnostics::RunLog;
use crate::error::FilterError;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};

/// Everything the scanner produced for one message.
#[derive(Debug)]
pub struct ScanOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub status: ExitStatus,
}

impl ScanOutput {
    pub fn clean(&self) -> bool {
        self.status.success() && self.stderr.is_empty()
    }
}

pub struct Scanner {
    path: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl Scanner {
    pub fn new(path: impl Into<PathBuf>, max_message_size: u64, extra_args: &str, timeout: Duration) -> Self {
        let mut args = vec!["-s".to_string(), max_message_size.to_string()];
        args.extend(extra_args.split_whitespace().map(str::to_string));
        // The child runs in the scanner's directory, so a relative path
        // would be resolved against the wrong base.
        let path = path.into();
        let path = std::path::absolute(&path).unwrap_or(path);
        Scanner {
            path,
            args,
            timeout,
        }
    }

    pub fn from_settings(settings: &ScanSettings) -> Self {
        Self::new(
            &settings.scanner_path,
            settings.max_message_size,
            &settings.scanner_args,
            settings.scan_timeout(),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Arguments passed to the scanner: the size limit flag, then the
    /// configured extras.
    pub fn command_args(&self) -> &[String] {
        &self.args
    }

    /// Pipes `input` through the scanner and collects its output.
    ///
    /// A non-zero exit or stderr output is logged but still returns the
    /// stdout bytes. Exceeding the timeout kills the child.
    pub async fn exchange(&self, input: Vec<u8>, log: &mut RunLog) -> Result<ScanOutput, FilterError> {
        if !self.path.is_file() {
            return Err(FilterError::ScannerMissing(self.path.clone()));
        }

        log.debug(format!(
            "Starting scanner process. PATH='{}', ARGS='{}'",
            self.path.display(),
            self.args.join(" ")
        ));
        let mut command = Command::new(&self.path);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(FilterError::Spawn)?;
        log.debug(format!(
            "Started scanner process. PID='{}'",
            child.id().unwrap_or_default()
        ));

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(FilterError::Aborted("scanner pipes were not captured".to_string()));
        };

        log.debug(format!("Copying message to scanner. BYTES={}", input.len()));
        let writer = tokio::spawn(feed(stdin, input));

        let exchange = async {
            let (out, err) = tokio::try_join!(drain(stdout), drain(stderr))?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((out, err, status))
        };
        let outcome = tokio::time::timeout(self.timeout, exchange).await;

        let (stdout, stderr, status) = match outcome {
            Ok(result) => result?,
            Err(_) => {
                writer.abort();
                if let Err(e) = child.kill().await {
                    log.warning(format!("Failed to kill timed out scanner: {e}"));
                }
                return Err(FilterError::ScannerTimeout(self.timeout));
            }
        };

        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                log.warning("Scanner closed its input before reading the whole message");
            }
            Ok(Err(e)) => log.error(format!("Failed writing message to scanner: {e}")),
            Err(e) => return Err(FilterError::Aborted(format!("scanner input task failed: {e}"))),
        }

        log.debug(format!("Read STDOUT from scanner. BYTES={}", stdout.len()));
        log.debug(format!("Read STDERR from scanner. BYTES={}", stderr.len()));

        let output = ScanOutput {
            stdout,
            stderr,
            status,
        };
        if !output.status.success() {
            log.error(format!("Scanner exited with {}", output.status));
        }
        if !output.stderr.is_empty() {
            log.error(format!(
                "Error from scanner: {}",
                String::from_utf8_lossy(&output.stderr).trim_end()
            ));
        }
        Ok(output)
    }
}

async fn feed(mut stdin: ChildStdin, input: Vec<u8>) -> std::io::Result<()> {
    stdin.write_all(&input).await?;
    stdin.flush().await?;
    // Dropping the handle closes the pipe and signals end of message.
    drop(stdin);
    Ok(())
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(buf)
}
