use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::InsightConfig;
use crate::error::{Error, Result};
use crate::fetcher::Fetcher;
use crate::llm::CompletionModel;
use crate::models::Source;
use crate::store::NewsStore;

pub const NOTHING_FOUND: &str =
    "We couldn't find any sources to analyze for this story. Try again later.";

const PROMPT_HEADER: &str = "You are an experienced journalist. Read the articles below and write a clear, structured summary in exactly this format:

KEY TAKEAWAYS:
• 3-4 main points drawn from all of the articles
• Each point in 1-2 sentences

MAIN STORY:
• The story told in 4-5 short paragraphs
• At most 2-3 sentences per paragraph
• Plain, direct language

KEY FACTS:
• 2-3 notable figures or facts
• Name the source where it matters

WHAT'S NEXT:
• 2-3 bullet points on likely consequences
• Stay grounded in what the articles say

Keep journalistic standards while making the summary quick to scan.

Source Articles:
";

/// What the caller asked to be summarised.
#[derive(Debug, Clone)]
pub enum InsightRequest {
    Query(String),
    Sources(Vec<Source>),
}

pub enum Insight {
    /// Memoized text from an earlier generation
    Cached(String),
    /// No sources to summarise; the model was not called
    NothingFound,
    /// Live model output, delta by delta
    Streaming(BoxStream<'static, String>),
}

pub struct InsightService {
    store: Arc<dyn NewsStore>,
    model: Arc<dyn CompletionModel>,
    fetcher: Arc<Fetcher>,
    config: InsightConfig,
}

impl InsightService {
    pub fn new(
        store: Arc<dyn NewsStore>,
        model: Arc<dyn CompletionModel>,
        fetcher: Arc<Fetcher>,
        config: InsightConfig,
    ) -> Self {
        Self {
            store,
            model,
            fetcher,
            config,
        }
    }

    /// Summarise the requested sources. `cancel` belongs to the inbound
    /// request; cancelling it stops generation and skips memoization.
    pub async fn generate(&self, request: InsightRequest, cancel: CancellationToken) -> Result<Insight> {
        let sources = match request {
            InsightRequest::Sources(sources) => sources,
            InsightRequest::Query(query) => {
                let found = self.fetcher.search_contents(&query).await?;
                debug!("Query '{}' resolved to {} sources", query, found.len());
                found.into_iter().map(Source::from).collect()
            }
        };

        if sources.is_empty() {
            return Ok(Insight::NothingFound);
        }

        let key = memo_key(&sources);
        if let Some(text) = self.store.get_memo(&key).await? {
            debug!("Insight cache hit for {}", key);
            return Ok(Insight::Cached(text));
        }

        // The time limit covers waiting for the model as well as streaming
        let max_duration = Duration::from_secs(self.config.max_duration_secs);
        let deadline = Instant::now() + max_duration;

        let prompt = build_prompt(&sources);
        let request = self.model.stream_completion(&prompt, cancel.clone());
        let deltas = match timeout_at(deadline, request).await {
            Ok(deltas) => deltas?,
            Err(_) => {
                warn!("Model did not start answering within {:?}", max_duration);
                cancel.cancel();
                return Err(Error::InvalidResponse {
                    service: "model",
                    message: format!("no response within {:?}", max_duration),
                });
            }
        };

        let (tx, rx) = mpsc::channel(32);
        let store = self.store.clone();
        let ttl = Duration::from_secs(self.config.memo_ttl_secs);
        tokio::spawn(relay(deltas, tx, cancel, store, key, ttl, deadline));

        Ok(Insight::Streaming(ReceiverStream::new(rx).boxed()))
    }
}

/// Forward deltas to the caller and memoize the full text if the model
/// finished cleanly.
async fn relay(
    mut deltas: crate::llm::DeltaStream,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
    store: Arc<dyn NewsStore>,
    key: String,
    ttl: Duration,
    deadline: Instant,
) {
    let expiry = sleep_until(deadline);
    tokio::pin!(expiry);
    let mut text = String::new();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Insight generation cancelled by the client");
                return;
            }
            _ = &mut expiry => {
                warn!("Insight generation ran out of time, stopping");
                cancel.cancel();
                return;
            }
            next = deltas.next() => next,
        };

        match next {
            Some(Ok(delta)) => {
                text.push_str(&delta);
                if tx.send(delta).await.is_err() {
                    info!("Insight client went away, stopping generation");
                    cancel.cancel();
                    return;
                }
            }
            Some(Err(e)) => {
                error!("Insight stream failed: {}", e);
                return;
            }
            None => break,
        }
    }

    if text.is_empty() {
        warn!("Model returned no text for {}", key);
        return;
    }
    if let Err(e) = store.set_memo(&key, &text, ttl).await {
        error!("Failed to memoize insight {}: {}", key, e);
    }
    // tx drops here, after the memo is written
    drop(tx);
}

/// Cache key for a set of sources: order and repeats don't matter.
pub fn memo_key(sources: &[Source]) -> String {
    let mut urls: Vec<&str> = sources.iter().map(|s| s.url.trim()).collect();
    urls.sort_unstable();
    urls.dedup();
    format!("ai-insights:{}", urls.join(","))
}

pub fn build_prompt(sources: &[Source]) -> String {
    let articles: Vec<String> = sources
        .iter()
        .map(|s| format!("URL: {}\nContent: {}", s.url, s.text))
        .collect();
    format!("{}{}", PROMPT_HEADER, articles.join("\n\n"))
}
