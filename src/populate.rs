use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::{error, info, warn};
use url::Url;

use crate::config::PopulateConfig;
use crate::error::Result;
use crate::fetcher::Fetcher;
use crate::models::{Article, ListingEntry};
use crate::store::NewsStore;

/// Refreshes every topic bucket from the upstream APIs.
pub struct Populator {
    fetcher: Arc<Fetcher>,
    store: Arc<dyn NewsStore>,
    config: PopulateConfig,
}

#[derive(Debug, Default)]
pub struct PopulateReport {
    /// Topic name and number of articles written
    pub succeeded: Vec<(String, usize)>,
    /// Topic name and the error that stopped it
    pub failed: Vec<(String, String)>,
}

impl PopulateReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

impl Populator {
    pub fn new(fetcher: Arc<Fetcher>, store: Arc<dyn NewsStore>, config: PopulateConfig) -> Self {
        Self {
            fetcher,
            store,
            config,
        }
    }

    /// Refresh all configured topics, a few at a time. A failing topic is
    /// reported and leaves its previous bucket in place.
    pub async fn populate_all(&self) -> PopulateReport {
        let concurrency = self.config.concurrency.max(1);
        info!(
            "Populating {} topics ({} at a time)",
            self.config.topics.len(),
            concurrency
        );

        let results: Vec<(String, Result<usize>)> = stream::iter(self.config.topics.clone())
            .map(|topic| async move {
                let result = self.populate_topic(&topic).await;
                (topic, result)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut report = PopulateReport::default();
        for (topic, result) in results {
            match result {
                Ok(count) => report.succeeded.push((topic, count)),
                Err(e) => {
                    error!("Failed to populate topic '{}': {}", topic, e);
                    report.failed.push((topic, e.to_string()));
                }
            }
        }

        // Completion order is arbitrary; report in configured order
        let order: HashMap<&str, usize> = self
            .config
            .topics
            .iter()
            .enumerate()
            .map(|(i, t)| (t.as_str(), i))
            .collect();
        report.succeeded.sort_by_key(|(t, _)| order.get(t.as_str()).copied());
        report.failed.sort_by_key(|(t, _)| order.get(t.as_str()).copied());

        info!(
            "Population complete: {} succeeded, {} failed",
            report.succeeded.len(),
            report.failed.len()
        );
        report
    }

    pub async fn populate_topic(&self, topic: &str) -> Result<usize> {
        let listing = self
            .fetcher
            .list_news(topic, self.config.per_topic_limit)
            .await?;
        let total = listing.len();

        let entries = filter_excluded(listing, &self.config.excluded_hosts);
        let urls: Vec<String> = entries.iter().map(|e| e.url.clone()).collect();
        info!(
            "Topic '{}': {} listed, {} after exclusions",
            topic,
            total,
            urls.len()
        );

        let mut articles = self.fetcher.get_contents(&urls).await?;
        backfill_published_dates(&mut articles, &entries);

        self.store.set_topic_bucket(topic, &articles).await?;
        Ok(articles.len())
    }
}

/// Drop entries whose hostname is on the exclusion list (exact match).
pub fn filter_excluded(entries: Vec<ListingEntry>, excluded_hosts: &[String]) -> Vec<ListingEntry> {
    let excluded: HashSet<&str> = excluded_hosts.iter().map(|h| h.as_str()).collect();

    entries
        .into_iter()
        .filter(|entry| match Url::parse(&entry.url) {
            Ok(url) => !url.host_str().is_some_and(|host| excluded.contains(host)),
            Err(e) => {
                warn!("Skipping listing entry with bad URL '{}': {}", entry.url, e);
                false
            }
        })
        .collect()
}

/// The extraction API reports when a page first appeared, which can be far
/// older than the story; take the listing's date instead.
pub fn backfill_published_dates(articles: &mut [Article], entries: &[ListingEntry]) {
    let dates: HashMap<&str, &str> = entries
        .iter()
        .filter_map(|e| e.published_at.as_deref().map(|d| (e.url.as_str(), d)))
        .collect();

    for article in articles.iter_mut() {
        if let Some(date) = dates.get(article.url.as_str()) {
            article.published_date = date.to_string();
        }
    }
}

fn populate_interval(minutes: u64) -> Duration {
    Duration::from_secs(minutes.saturating_mul(60))
}

pub async fn start_background_populate(populator: Arc<Populator>, interval_minutes: u64) {
    let interval = populate_interval(interval_minutes);

    info!("Starting initial population");
    let report = populator.populate_all().await;
    if !report.is_success() {
        error!("Initial population had {} failed topics", report.failed.len());
    }

    loop {
        tokio::time::sleep(interval).await;
        info!("Starting scheduled population");
        let report = populator.populate_all().await;
        if !report.is_success() {
            error!("Scheduled population had {} failed topics", report.failed.len());
        }
    }
}
