//! Line framing
//!
//! The MMU speaks newline-terminated ASCII. Reads from the port arrive in
//! arbitrary chunks, so a trailing partial line is held back until the rest
//! of it shows up.

/// Splits a byte stream into complete lines.
///
/// The held-back partial line never contains a `\n`.
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: Vec<u8>,
}

impl LineBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of received bytes, returning every line it completes.
    ///
    /// Lines are returned without their `\n`. Anything after the last `\n`
    /// is kept and prefixed to the first line of the next call.
    pub fn feed(&mut self, data: &[u8]) -> Lines {
        let mut lines = Vec::new();
        let mut rest = data;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.partial.extend_from_slice(&rest[..pos]);
            let raw = std::mem::take(&mut self.partial);
            lines.push(String::from_utf8_lossy(&raw).into_owned());
            rest = &rest[pos + 1..];
        }
        self.partial.extend_from_slice(rest);

        Lines {
            inner: lines.into_iter(),
        }
    }

    /// Bytes received but not yet terminated
    pub fn pending(&self) -> &[u8] {
        &self.partial
    }

    /// Drop any held-back partial line
    pub fn clear(&mut self) {
        self.partial.clear();
    }
}

/// Lines completed by a single [`LineBuffer::feed`] call
#[derive(Debug)]
pub struct Lines {
    inner: std::vec::IntoIter<String>,
}

impl Iterator for Lines {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Lines {}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_no_terminator_yields_nothing() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.feed(b"").count(), 0);
        assert_eq!(buf.feed(b"sta").count(), 0);
        assert_eq!(buf.pending(), b"sta");
    }

    #[test]
    fn test_partial_line_is_prefixed() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.feed(b"1o").count(), 0);
        let lines: Vec<String> = buf.feed(b"k\nsta").collect();
        assert_eq!(lines, vec!["1ok".to_string()]);
        let lines: Vec<String> = buf.feed(b"rt\n").collect();
        assert_eq!(lines, vec!["start".to_string()]);
        assert!(buf.pending().is_empty());
    }

    #[test]
    fn test_multiple_lines_in_one_chunk() {
        let mut buf = LineBuffer::new();
        let lines: Vec<String> = buf.feed(b"ok\nstart\n\n0ok\n").collect();
        assert_eq!(lines, vec!["ok", "start", "", "0ok"]);
    }

    #[test]
    fn test_chunking_invariance() {
        let stream: &[u8] = b"start\n1ok\nsomething unexpected\n302ok\n0ok\ntrailing";
        let expected: Vec<String> = {
            let mut buf = LineBuffer::new();
            buf.feed(stream).collect()
        };
        assert_eq!(expected.len(), 5);

        for chunk_size in 1..=stream.len() {
            let mut buf = LineBuffer::new();
            let mut got = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                got.extend(buf.feed(chunk));
                assert!(!buf.pending().contains(&b'\n'));
            }
            assert_eq!(got, expected, "chunk size {}", chunk_size);
            assert_eq!(buf.pending(), b"trailing");
        }
    }
}
