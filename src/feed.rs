use std::cmp::Reverse;
use std::collections::HashSet;

use tracing::debug;

use crate::error::Result;
use crate::models::Article;
use crate::store::NewsStore;

/// Upper bound on articles returned by one feed query.
pub const MAX_FEED_ARTICLES: usize = 100;

pub const DEFAULT_FEED_TOPICS: [&str; 4] = ["general", "technology", "science", "health"];

/// Split a comma-separated topic list, dropping blanks.
pub fn parse_topics(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

pub fn default_topics() -> Vec<String> {
    DEFAULT_FEED_TOPICS.iter().map(|t| t.to_string()).collect()
}

/// Read the buckets for `topics` in order and build the feed. Missing
/// buckets count as empty.
pub async fn query_feed(store: &dyn NewsStore, topics: &[String]) -> Result<Vec<Article>> {
    let mut merged = Vec::new();
    for topic in topics {
        if let Some(mut articles) = store.get_topic_bucket(topic).await? {
            debug!("Topic '{}' contributed {} articles", topic, articles.len());
            merged.append(&mut articles);
        }
    }

    Ok(build_feed(merged, MAX_FEED_ARTICLES))
}

/// Dedup by title (first seen wins), order newest first, keep at most `limit`.
pub fn build_feed(articles: Vec<Article>, limit: usize) -> Vec<Article> {
    let mut feed = dedup_by_title(articles);
    sort_by_recency(&mut feed);
    feed.truncate(limit);
    feed
}

pub fn dedup_by_title(articles: Vec<Article>) -> Vec<Article> {
    let mut seen = HashSet::new();
    articles
        .into_iter()
        .filter(|a| seen.insert(a.title.clone()))
        .collect()
}

/// Stable sort, newest first. Undated articles keep their relative order
/// behind all dated ones.
pub fn sort_by_recency(articles: &mut [Article]) {
    // Reverse(None) compares greater than any Reverse(Some(_))
    articles.sort_by_key(|a| Reverse(a.published_at()));
}
