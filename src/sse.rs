//! Line framing shared by the upstream model reader and the insight client.

/// Accumulates raw body chunks and yields complete lines without their
/// terminators. Chunks may split lines, and multi-byte characters, anywhere.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Whatever is left once the body ends without a trailing newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// Payload of a `data:` line, if the line is one.
pub fn data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(|rest| rest.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_split_across_chunks() {
        let mut decoder = LineDecoder::default();
        assert!(decoder.push(b"data: {\"te").is_empty());
        let lines = decoder.push(b"xt\":\"a\"}\n\ndata: x\n");
        assert_eq!(lines, vec!["data: {\"text\":\"a\"}", "", "data: x"]);
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_crlf_stripped() {
        let mut decoder = LineDecoder::default();
        assert_eq!(decoder.push(b"one\r\ntwo\r\n"), vec!["one", "two"]);
    }

    #[test]
    fn test_multibyte_char_split() {
        let mut decoder = LineDecoder::default();
        let bytes = "caf\u{e9}\n".as_bytes();
        assert!(decoder.push(&bytes[..4]).is_empty());
        assert_eq!(decoder.push(&bytes[4..]), vec!["caf\u{e9}"]);
    }

    #[test]
    fn test_finish_returns_tail() {
        let mut decoder = LineDecoder::default();
        decoder.push(b"data: tail");
        assert_eq!(decoder.finish().as_deref(), Some("data: tail"));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_data_payload() {
        assert_eq!(data_payload("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(data_payload("data:[DONE]"), Some("[DONE]"));
        assert_eq!(data_payload("event: token"), None);
    }
}
