//! Header markers and trace-header removal.

use crate::diagnostics::RunLog;
use crate::locate::locate;

/// One message, headers and body, owned by a single pipeline run.
pub type MessageBuffer = Vec<u8>;

pub const RECEIVED_MARKER: &[u8] = b"Received: ";
pub const SCORE_MARKER: &[u8] = b"X-Spam-Score: ";
pub const DISCARD_FLAG: &[u8] = b"X-Spam-Discard: YES\n";
pub const LINE_TERMINATOR: &[u8] = b"\n";
/// First byte of a folded continuation line.
pub const CONTINUATION: u8 = b' ';

/// Offset one past the header section (the first byte of the separator
/// blank line), or the buffer length when no separator is present.
pub fn header_section_end(buf: &[u8]) -> usize {
    let lf = locate(buf, b"\n\n", 0).map(|i| i + 1);
    let crlf = locate(buf, b"\n\r\n", 0).map(|i| i + 1);
    match (lf, crlf) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) | (None, Some(a)) => a,
        (None, None) => buf.len(),
    }
}

/// Finds the first header line starting with `marker` inside the header section.
fn find_header(buf: &[u8], marker: &[u8]) -> Option<usize> {
    let section = &buf[..header_section_end(buf)];
    let mut from = 0;
    while let Some(pos) = locate(section, marker, from) {
        if pos == 0 || section[pos - 1] == b'\n' {
            return Some(pos);
        }
        from = pos + 1;
    }
    None
}

/// Removes the folded header block whose first line starts at `start`.
///
/// The anchor stays fixed: each pass deletes the physical line at `start`
/// together with its terminator, and the next pass looks at whatever has
/// shifted down into `start`. Stops once that line is not a continuation.
fn remove_folded_block(buf: &mut MessageBuffer, start: usize, log: &mut RunLog) -> usize {
    let mut removed = 0;
    loop {
        let end = match locate(buf, LINE_TERMINATOR, start) {
            Some(end) => end,
            // Unterminated last line
            None => buf.len() - 1,
        };
        let continued = buf.get(end + 1) == Some(&CONTINUATION);
        log.debug(format!(
            "Removing header line at {start}..={end}, continuation follows: {continued}"
        ));
        buf.drain(start..=end);
        removed += end - start + 1;
        if !continued {
            return removed;
        }
    }
}

/// Removes the first `count` folded header blocks beginning with `marker`.
///
/// Each iteration searches again from the top of the message. Returns the
/// number of blocks actually removed, which is less than `count` when the
/// message runs out of matching headers.
pub fn skip_headers(
    buf: &mut MessageBuffer,
    marker: &[u8],
    count: usize,
    log: &mut RunLog,
) -> usize {
    let name = String::from_utf8_lossy(marker).trim_end().to_string();
    for i in 0..count {
        let Some(start) = find_header(buf, marker) else {
            log.warning(format!(
                "Asked to skip {count} '{name}' headers but only {i} present. Continuing with remaining headers."
            ));
            return i;
        };
        log.debug(format!("Skipping #{i} '{name}' header at offset {start}"));
        let bytes = remove_folded_block(buf, start, log);
        log.debug(format!("Finished skipping #{i}, removed {bytes} bytes"));
    }
    count
}
