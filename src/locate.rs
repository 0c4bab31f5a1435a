/// Returns the lowest index `>= from` at which `needle` occurs in `haystack`.
///
/// Empty inputs, an offset past the end, or a needle longer than the
/// remaining region all yield `None`. Comparison is byte-exact.
pub fn locate(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if haystack.is_empty() || needle.is_empty() || from >= haystack.len() {
        return None;
    }
    if needle.len() > haystack.len() - from {
        return None;
    }

    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_inputs_not_found() {
        assert_eq!(locate(b"", b"a", 0), None);
        assert_eq!(locate(b"abc", b"", 0), None);
    }

    #[test]
    fn test_needle_longer_than_remaining() {
        assert_eq!(locate(b"abc", b"abcd", 0), None);
        assert_eq!(locate(b"abcabc", b"abc", 4), None);
        assert_eq!(locate(b"abc", b"c", 3), None);
        assert_eq!(locate(b"abc", b"c", 10), None);
    }

    #[test]
    fn test_lowest_index_from_offset() {
        let haystack = b"Received: a\nReceived: b\n";
        assert_eq!(locate(haystack, b"Received: ", 0), Some(0));
        assert_eq!(locate(haystack, b"Received: ", 1), Some(12));
        assert_eq!(locate(haystack, b"Received: ", 12), Some(12));
        assert_eq!(locate(haystack, b"\n", 12), Some(23));
    }

    #[test]
    fn test_case_sensitive() {
        assert_eq!(locate(b"received: x", b"Received: ", 0), None);
        assert_eq!(locate(b"xxX-Spam-Score: 1", b"X-Spam-Score: ", 0), Some(2));
    }

    #[test]
    fn test_match_at_end() {
        assert_eq!(locate(b"abcdef", b"ef", 0), Some(4));
        assert_eq!(locate(b"abcdef", b"ef", 4), Some(4));
    }
}
