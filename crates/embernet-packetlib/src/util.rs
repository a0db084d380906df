//! Small byte-sequence helpers shared by the protocol modules.

/// First index at which `pattern` occurs as a contiguous sub-sequence of
/// `buffer`, or `None` when absent.
///
/// Naive scan; the inputs here (HTTP messages, DHCP payloads) are at most a
/// few KiB and the patterns a handful of bytes.
pub fn locate(buffer: &[u8], pattern: &[u8]) -> Option<usize> {
    if pattern.is_empty() || pattern.len() > buffer.len() {
        return None;
    }
    buffer
        .windows(pattern.len())
        .position(|window| window == pattern)
}

#[cfg(test)]
mod tests {
    use super::locate;

    #[test]
    fn locate_finds_first_occurrence() {
        let haystack = b"GET / HTTP/1.1\r\nHost: a\r\n\r\nbody\r\n\r\n";
        assert_eq!(locate(haystack, b"\r\n\r\n"), Some(25));
        assert_eq!(locate(haystack, b"GET"), Some(0));
    }

    #[test]
    fn locate_misses() {
        assert_eq!(locate(b"abc", b"abcd"), None);
        assert_eq!(locate(b"abc", b"x"), None);
        assert_eq!(locate(b"abc", b""), None);
    }

    #[test]
    fn locate_pattern_at_end() {
        assert_eq!(locate(b"xxab", b"ab"), Some(2));
    }
}
