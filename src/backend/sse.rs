//! Incremental Server-Sent Events decoder.
//!
//! Bytes arrive in arbitrary chunks; [`SseDecoder::next_event`] returns one
//! `data:` payload at a time once its line is complete.

use bytes::BytesMut;

/// Payload that terminates an OpenAI-style stream.
pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Data(String),
    Done,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: BytesMut,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete event, or `None` if more bytes are needed.
    ///
    /// Blank lines, `:` comments and non-`data` fields (`event:`, `id:`,
    /// `retry:`) are skipped.
    pub fn next_event(&mut self) -> Option<SseEvent> {
        while let Some(line_end) = find_newline(&self.buf) {
            let line = self.buf.split_to(line_end);
            let line = String::from_utf8_lossy(&line);
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with(':') {
                continue;
            }

            if let Some(data) = trimmed.strip_prefix("data:") {
                let data = data.trim();
                if data == DONE_SENTINEL {
                    return Some(SseEvent::Done);
                }
                return Some(SseEvent::Data(data.to_string()));
            }
        }
        None
    }
}

/// Position just past the next `\n`.
fn find_newline(buf: &BytesMut) -> Option<usize> {
    buf.iter().position(|&b| b == b'\n').map(|pos| pos + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_across_chunks() {
        let mut dec = SseDecoder::new();
        dec.push(b"data: {\"a\":");
        assert_eq!(dec.next_event(), None);
        dec.push(b"1}\n\ndata: [DONE]\n\n");
        assert_eq!(dec.next_event(), Some(SseEvent::Data("{\"a\":1}".to_string())));
        assert_eq!(dec.next_event(), Some(SseEvent::Done));
        assert_eq!(dec.next_event(), None);
    }

    #[test]
    fn test_skips_comments_and_other_fields() {
        let mut dec = SseDecoder::new();
        dec.push(b": OPENROUTER PROCESSING\r\n\r\nevent: message\nid: 7\ndata:{}\n");
        assert_eq!(dec.next_event(), Some(SseEvent::Data("{}".to_string())));
        assert_eq!(dec.next_event(), None);
    }
}
