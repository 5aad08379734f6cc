use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::OpenAiConfig;
use crate::error::{Error, Result};
use crate::sse::{data_payload, LineDecoder};

const OPENAI: &str = "openai";

/// Text deltas of one completion, in order.
pub type DeltaStream = BoxStream<'static, Result<String>>;

/// A hosted language model that streams its answer.
#[async_trait]
pub trait CompletionModel: Send + Sync {
    /// Start a completion for `prompt`. Fails if the model rejects the
    /// request; once the stream is returned, later failures arrive as `Err`
    /// items. Cancelling `cancel` ends the stream and drops the upstream call.
    async fn stream_completion(&self, prompt: &str, cancel: CancellationToken) -> Result<DeltaStream>;
}

/// Chat-completions client for OpenAI-compatible endpoints.
pub struct OpenAiClient {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        // No overall timeout: generations are bounded by the caller's token
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent("Epigram/1.0 (News Aggregator)")
            .build()?;

        Ok(Self { client, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }
}

#[async_trait]
impl CompletionModel for OpenAiClient {
    async fn stream_completion(&self, prompt: &str, cancel: CancellationToken) -> Result<DeltaStream> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let body = json!({
            "model": self.config.model,
            "stream": true,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let request = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::InvalidResponse {
                    service: OPENAI,
                    message: "request cancelled before the model answered".to_string(),
                });
            }
            response = request => response?,
        };

        if !response.status().is_success() {
            return Err(Error::from_response(OPENAI, response).await);
        }
        debug!("Streaming completion from {}", self.config.model);

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut lines = LineDecoder::default();

            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Completion cancelled, dropping upstream connection");
                        return;
                    }
                    chunk = body.next() => chunk,
                };

                let bytes = match chunk {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                    None => return,
                };

                for line in lines.push(&bytes) {
                    match parse_chunk_line(&line) {
                        ChunkLine::Delta(text) => {
                            if tx.send(Ok(text)).await.is_err() {
                                return;
                            }
                        }
                        ChunkLine::Done => return,
                        ChunkLine::Skip => {}
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

#[derive(Debug, PartialEq)]
pub enum ChunkLine {
    Delta(String),
    Done,
    Skip,
}

/// Interpret one line of a chat-completions event stream.
pub fn parse_chunk_line(line: &str) -> ChunkLine {
    let Some(data) = data_payload(line) else {
        return ChunkLine::Skip;
    };
    if data == "[DONE]" {
        return ChunkLine::Done;
    }
    if data.is_empty() {
        return ChunkLine::Skip;
    }

    match serde_json::from_str::<Value>(data) {
        Ok(value) => value
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(|s| ChunkLine::Delta(s.to_string()))
            .unwrap_or(ChunkLine::Skip),
        Err(e) => {
            warn!("Skipping malformed completion chunk: {}", e);
            ChunkLine::Skip
        }
    }
}
