//! Consumer side of the insight event stream.
//!
//! The server frames every delta as `data: {"text": "..."}`. A reader
//! appends deltas to a buffer and hands snapshots of it to a display
//! callback, at most once per throttle interval, so a fast model doesn't
//! force a redraw per token.

use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};
use serde::Deserialize;
use tracing::warn;

use crate::sse::{data_payload, LineDecoder};

pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(200);

#[derive(Deserialize)]
struct TextDelta {
    text: String,
}

/// The text delta carried by one stream line. Blank lines and non-data
/// fields yield `None` silently; malformed data lines are logged.
pub fn parse_delta_line(line: &str) -> Option<String> {
    let payload = data_payload(line)?;
    match serde_json::from_str::<TextDelta>(payload) {
        Ok(delta) => Some(delta.text),
        Err(e) => {
            warn!("Skipping malformed insight line {:?}: {}", line, e);
            None
        }
    }
}

/// Accumulated insight text plus the throttle state for publishing it.
#[derive(Debug)]
pub struct ThrottledText {
    text: String,
    interval: Duration,
    last_publish: Option<Instant>,
    dirty: bool,
}

impl ThrottledText {
    pub fn new(interval: Duration) -> Self {
        Self {
            text: String::new(),
            interval,
            last_publish: None,
            dirty: false,
        }
    }

    /// Append a delta; returns the buffer if enough time passed since the
    /// previous publish.
    pub fn push(&mut self, delta: &str, now: Instant) -> Option<&str> {
        self.text.push_str(delta);
        self.dirty = true;

        let due = self
            .last_publish
            .map_or(true, |last| now.duration_since(last) >= self.interval);
        if due {
            self.last_publish = Some(now);
            self.dirty = false;
            Some(&self.text)
        } else {
            None
        }
    }

    /// Text not yet published, if any.
    pub fn flush(&mut self) -> Option<&str> {
        if self.dirty {
            self.dirty = false;
            Some(&self.text)
        } else {
            None
        }
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

/// Drain an insight response body, calling `on_update` with throttled
/// snapshots of the text so far, and return the complete text.
pub async fn read_insight<S, B, E, F>(body: S, interval: Duration, mut on_update: F) -> Result<String, E>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    F: FnMut(&str),
{
    futures::pin_mut!(body);
    let mut lines = LineDecoder::default();
    let mut buffer = ThrottledText::new(interval);

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        for line in lines.push(chunk.as_ref()) {
            if let Some(delta) = parse_delta_line(&line) {
                if let Some(snapshot) = buffer.push(&delta, Instant::now()) {
                    on_update(snapshot);
                }
            }
        }
    }

    if let Some(line) = lines.finish() {
        if let Some(delta) = parse_delta_line(&line) {
            buffer.push(&delta, Instant::now());
        }
    }
    if let Some(snapshot) = buffer.flush() {
        on_update(snapshot);
    }

    Ok(buffer.into_text())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::convert::Infallible;

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Vec<u8>, Infallible>> {
        let owned: Vec<Result<Vec<u8>, Infallible>> =
            parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        stream::iter(owned)
    }

    mod parse_delta_line_tests {
        use super::*;

        #[test]
        fn test_text_delta() {
            assert_eq!(
                parse_delta_line(r#"data: {"text":"Hello"}"#).as_deref(),
                Some("Hello")
            );
        }

        #[test]
        fn test_blank_and_other_fields_ignored() {
            assert_eq!(parse_delta_line(""), None);
            assert_eq!(parse_delta_line("event: message"), None);
            assert_eq!(parse_delta_line(": ping"), None);
        }

        #[test]
        fn test_malformed_data_skipped() {
            assert_eq!(parse_delta_line("data: {oops"), None);
            assert_eq!(parse_delta_line(r#"data: {"delta":"x"}"#), None);
        }
    }

    mod throttle_tests {
        use super::*;

        #[test]
        fn test_first_push_publishes() {
            let mut buffer = ThrottledText::new(Duration::from_millis(200));
            assert_eq!(buffer.push("a", Instant::now()), Some("a"));
        }

        #[test]
        fn test_pushes_within_interval_held_back() {
            let start = Instant::now();
            let mut buffer = ThrottledText::new(Duration::from_millis(200));

            assert!(buffer.push("a", start).is_some());
            assert!(buffer.push("b", start + Duration::from_millis(50)).is_none());
            assert!(buffer.push("c", start + Duration::from_millis(150)).is_none());
            assert_eq!(buffer.push("d", start + Duration::from_millis(200)), Some("abcd"));
        }

        #[test]
        fn test_flush_only_when_dirty() {
            let start = Instant::now();
            let mut buffer = ThrottledText::new(Duration::from_millis(200));

            buffer.push("a", start);
            assert_eq!(buffer.flush(), None);
            buffer.push("b", start + Duration::from_millis(10));
            assert_eq!(buffer.flush(), Some("ab"));
            assert_eq!(buffer.flush(), None);
            assert_eq!(buffer.into_text(), "ab");
        }
    }

    mod read_insight_tests {
        use super::*;

        #[tokio::test]
        async fn test_reads_split_frames() {
            let body = chunks(&[
                "data: {\"text\":\"Key \"}\n\nda",
                "ta: {\"text\":\"takeaways\"}\n\n",
                "data: not json\n\n",
                "data: {\"text\":\":\"}",
            ]);

            let mut updates = Vec::new();
            let text = read_insight(body, Duration::from_secs(60), |s| updates.push(s.to_string()))
                .await
                .unwrap();

            assert_eq!(text, "Key takeaways:");
            // first delta publishes at once, the rest arrive in the final flush
            assert_eq!(updates, vec!["Key ", "Key takeaways:"]);
        }

        #[tokio::test]
        async fn test_zero_interval_publishes_every_delta() {
            let body = chunks(&["data: {\"text\":\"a\"}\n\ndata: {\"text\":\"b\"}\n\n"]);

            let mut updates = Vec::new();
            let text = read_insight(body, Duration::ZERO, |s| updates.push(s.to_string()))
                .await
                .unwrap();

            assert_eq!(text, "ab");
            assert_eq!(updates, vec!["a", "ab"]);
        }

        #[tokio::test]
        async fn test_empty_body() {
            let mut updates = 0;
            let text = read_insight(chunks(&[]), DEFAULT_THROTTLE, |_| updates += 1)
                .await
                .unwrap();
            assert_eq!(text, "");
            assert_eq!(updates, 0);
        }

        #[tokio::test]
        async fn test_transport_error_propagates() {
            let body = stream::iter(vec![
                Ok(b"data: {\"text\":\"a\"}\n".to_vec()),
                Err("connection reset"),
            ]);
            let result = read_insight(body, DEFAULT_THROTTLE, |_| {}).await;
            assert_eq!(result, Err("connection reset"));
        }
    }
}
