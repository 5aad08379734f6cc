use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::db::Database;
use crate::error::Result;
use crate::models::Article;

pub fn topic_key(topic: &str) -> String {
    format!("news:{}", topic)
}

/// The narrow view of the cache the rest of the service works against.
#[async_trait]
pub trait NewsStore: Send + Sync {
    /// Articles cached for `topic`; `None` when the bucket was never written.
    async fn get_topic_bucket(&self, topic: &str) -> Result<Option<Vec<Article>>>;

    /// Replace the whole bucket for `topic`.
    async fn set_topic_bucket(&self, topic: &str, articles: &[Article]) -> Result<()>;

    async fn get_memo(&self, key: &str) -> Result<Option<String>>;

    async fn set_memo(&self, key: &str, text: &str, ttl: Duration) -> Result<()>;

    /// Bump the counter at `key`, returning the count including this call.
    async fn increment_counter(&self, key: &str, ttl: Duration) -> Result<u64>;
}

#[async_trait]
impl NewsStore for Database {
    async fn get_topic_bucket(&self, topic: &str) -> Result<Option<Vec<Article>>> {
        let key = topic_key(topic);
        match self.get(&key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => {
                debug!("Topic bucket '{}' is empty", key);
                Ok(None)
            }
        }
    }

    async fn set_topic_bucket(&self, topic: &str, articles: &[Article]) -> Result<()> {
        let raw = serde_json::to_string(articles)?;
        self.set(&topic_key(topic), &raw, None).await
    }

    async fn get_memo(&self, key: &str) -> Result<Option<String>> {
        self.get(key).await
    }

    async fn set_memo(&self, key: &str, text: &str, ttl: Duration) -> Result<()> {
        self.set(key, text, Some(ttl)).await
    }

    async fn increment_counter(&self, key: &str, ttl: Duration) -> Result<u64> {
        self.increment(key, ttl).await
    }
}
