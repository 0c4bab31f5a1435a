//! Score extraction from scanner output and discard-flag injection.

use crate::diagnostics::RunLog;
use crate::headers::{MessageBuffer, DISCARD_FLAG, LINE_TERMINATOR, SCORE_MARKER};
use crate::locate::locate;

/// Why no score could be read from the scanner output.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScoreError {
    #[error("Could not find start of score in message")]
    MarkerMissing,

    #[error("Could not find end of score in message")]
    TerminatorMissing,

    #[error("Could not parse score '{0}'")]
    Unparseable(String),
}

/// Position and value of the score header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreHeader {
    /// Offset of the score marker.
    pub offset: usize,
    pub score: f64,
}

/// Outcome of the score decision for one message.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ScanResult {
    #[default]
    Unscored,
    Passed {
        score: f64,
    },
    Flagged {
        score: f64,
    },
}

impl ScanResult {
    pub fn score(&self) -> Option<f64> {
        match self {
            ScanResult::Unscored => None,
            ScanResult::Passed { score } | ScanResult::Flagged { score } => Some(*score),
        }
    }

    pub fn flagged(&self) -> bool {
        matches!(self, ScanResult::Flagged { .. })
    }
}

/// Reads the first score header in `buf`.
pub fn read_score(buf: &[u8]) -> Result<ScoreHeader, ScoreError> {
    let offset = locate(buf, SCORE_MARKER, 0).ok_or(ScoreError::MarkerMissing)?;
    let start = offset + SCORE_MARKER.len();
    let end = locate(buf, LINE_TERMINATOR, start).ok_or(ScoreError::TerminatorMissing)?;

    let raw = String::from_utf8_lossy(&buf[start..end]);
    let text = raw.trim();
    let score = text
        .parse::<f64>()
        .ok()
        .filter(|s| s.is_finite())
        .ok_or_else(|| ScoreError::Unparseable(text.to_string()))?;

    Ok(ScoreHeader { offset, score })
}

/// Decides on the scanner output and, at or above `threshold`, inserts the
/// discard flag directly before the score header.
///
/// Missing or malformed scores leave `buf` untouched.
pub fn apply_verdict(buf: &mut MessageBuffer, threshold: f64, log: &mut RunLog) -> ScanResult {
    let header = match read_score(buf) {
        Ok(header) => header,
        Err(e) => {
            log.warning(e.to_string());
            return ScanResult::Unscored;
        }
    };

    let score = header.score;
    if score >= threshold {
        log.info(format!(
            "Score({score}) above threshold({threshold}), flagging for discard."
        ));
        buf.splice(header.offset..header.offset, DISCARD_FLAG.iter().copied());
        ScanResult::Flagged { score }
    } else {
        log.info(format!("Score({score}) below threshold({threshold}), passing."));
        ScanResult::Passed { score }
    }
}
