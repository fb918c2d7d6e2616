//! Line framer - byte stream to line boundary resolution
//!
//! Serial reads arrive in arbitrary chunks. The framer keeps every byte after
//! the last terminator and stitches it onto the next chunk, so a line split
//! anywhere (including inside a decimal value) comes out whole.

/// Upper bound for an unterminated line before the buffer is discarded.
///
/// A line-noise burst with no newline would otherwise grow without limit.
pub const MAX_PENDING_BYTES: usize = 4096;

/// Splits an incoming byte stream into complete text lines
#[derive(Debug, Default)]
pub struct LineFramer {
    /// Bytes received after the last line terminator
    pending: Vec<u8>,
}

impl LineFramer {
    /// Create an empty framer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completes, in arrival order
    ///
    /// The terminator is `\n`; a `\r` immediately before it is stripped.
    /// Invalid UTF-8 is replaced rather than rejected, the codec will simply
    /// fail to match such a line.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;

        while let Some(offset) = self.pending[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            let mut raw = &self.pending[start..end];
            if let Some((&b'\r', rest)) = raw.split_last() {
                raw = rest;
            }
            lines.push(String::from_utf8_lossy(raw).into_owned());
            start = end + 1;
        }

        self.pending.drain(..start);

        if self.pending.len() > MAX_PENDING_BYTES {
            tracing::trace!(
                bytes = self.pending.len(),
                "Discarding oversized unterminated input"
            );
            self.pending.clear();
        }

        lines
    }

    /// Bytes currently held back waiting for a terminator
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop any partial line
    pub fn reset(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_complete_line() {
        let mut framer = LineFramer::new();
        assert_eq!(framer.feed(b"ENC:1:5:0.550\n"), vec!["ENC:1:5:0.550"]);
        assert_eq!(framer.pending_len(), 0);
    }

    #[test]
    fn test_split_inside_decimal() {
        let mut framer = LineFramer::new();
        assert!(framer.feed(b"ENC:2:-3:0.").is_empty());
        assert_eq!(framer.pending_len(), 11);
        assert_eq!(framer.feed(b"120\n"), vec!["ENC:2:-3:0.120"]);
    }

    #[test]
    fn test_multiple_lines_and_trailing_partial() {
        let mut framer = LineFramer::new();
        let lines = framer.feed(b"READY\r\nENC:1:1:0.010\nENC:4");
        assert_eq!(lines, vec!["READY", "ENC:1:1:0.010"]);
        assert_eq!(framer.feed(b":-1:0.990\n"), vec!["ENC:4:-1:0.990"]);
    }

    #[test]
    fn test_empty_lines_are_kept() {
        let mut framer = LineFramer::new();
        assert_eq!(framer.feed(b"\n\n"), vec!["", ""]);
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut framer = LineFramer::new();
        let mut out = Vec::new();
        for b in b"ENC:3:12:0.875\n" {
            out.extend(framer.feed(&[*b]));
        }
        assert_eq!(out, vec!["ENC:3:12:0.875"]);
    }

    #[test]
    fn test_oversized_garbage_is_discarded() {
        let mut framer = LineFramer::new();
        let noise = vec![b'x'; MAX_PENDING_BYTES + 1];
        assert!(framer.feed(&noise).is_empty());
        assert_eq!(framer.pending_len(), 0);
        assert_eq!(framer.feed(b"ENC:1:1:0.500\n"), vec!["ENC:1:1:0.500"]);
    }

    #[test]
    fn test_reset_drops_partial() {
        let mut framer = LineFramer::new();
        framer.feed(b"ENC:1:");
        framer.reset();
        assert_eq!(framer.feed(b"2:0.3\n"), vec!["2:0.3"]);
    }
}
