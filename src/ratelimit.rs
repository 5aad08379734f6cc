use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::RateLimitConfig;
use crate::error::Result;
use crate::store::NewsStore;

/// Identity shared by every caller we can't attribute to an address.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Fixed-window request limiter for one endpoint.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn NewsStore>,
    prefix: String,
    max_requests: u64,
    window: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn NewsStore>, prefix: &str, config: &RateLimitConfig) -> Self {
        Self {
            store,
            prefix: prefix.to_string(),
            max_requests: config.max_requests,
            window: Duration::from_secs(config.window_secs.max(1)),
        }
    }

    /// Count this request against `identity`; `false` once the window is spent.
    pub async fn check(&self, identity: &str) -> Result<bool> {
        self.check_at(identity, Utc::now()).await
    }

    pub async fn check_at(&self, identity: &str, now: DateTime<Utc>) -> Result<bool> {
        let key = self.window_key(identity, now);
        let count = self.store.increment_counter(&key, self.window).await?;
        if count > self.max_requests {
            warn!("Rate limit exceeded for {} ({} requests)", key, count);
            return Ok(false);
        }
        Ok(true)
    }

    fn window_key(&self, identity: &str, now: DateTime<Utc>) -> String {
        let window = now.timestamp().div_euclid(self.window.as_secs() as i64);
        format!("ratelimit:{}:{}:{}", self.prefix, identity, window)
    }
}

/// Best-effort caller address: the first `x-forwarded-for` hop.
pub fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .unwrap_or(UNKNOWN_CLIENT)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use axum::http::HeaderValue;
    use chrono::TimeZone;
    use tokio_test::{assert_err, assert_ok};

    async fn create_limiter(prefix: &str) -> (RateLimiter, Arc<Database>) {
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.initialize().await.unwrap();
        let db = Arc::new(db);
        let limiter = RateLimiter::new(db.clone(), prefix, &RateLimitConfig::default());
        (limiter, db)
    }

    mod client_ip_tests {
        use super::*;

        #[test]
        fn test_first_forwarded_hop() {
            let mut headers = HeaderMap::new();
            headers.insert(
                "x-forwarded-for",
                HeaderValue::from_static(" 203.0.113.7 , 10.0.0.1"),
            );
            assert_eq!(client_ip(&headers), "203.0.113.7");
        }

        #[test]
        fn test_missing_header_is_unknown() {
            assert_eq!(client_ip(&HeaderMap::new()), UNKNOWN_CLIENT);
        }

        #[test]
        fn test_empty_header_is_unknown() {
            let mut headers = HeaderMap::new();
            headers.insert("x-forwarded-for", HeaderValue::from_static(""));
            assert_eq!(client_ip(&headers), UNKNOWN_CLIENT);
        }
    }

    mod window_tests {
        use super::*;

        #[tokio::test]
        async fn test_fifth_allowed_sixth_rejected() {
            let (limiter, _db) = create_limiter("ai-insight").await;
            let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 5).unwrap();

            for i in 1..=5 {
                assert!(limiter.check_at("1.2.3.4", now).await.unwrap(), "request {}", i);
            }
            assert!(!limiter.check_at("1.2.3.4", now).await.unwrap());
        }

        #[tokio::test]
        async fn test_identities_counted_separately() {
            let (limiter, _db) = create_limiter("ai-insight").await;
            let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 5).unwrap();

            for _ in 0..5 {
                limiter.check_at("1.1.1.1", now).await.unwrap();
            }
            assert!(!limiter.check_at("1.1.1.1", now).await.unwrap());
            assert!(limiter.check_at("2.2.2.2", now).await.unwrap());
        }

        #[tokio::test]
        async fn test_endpoints_counted_separately() {
            let db = Database::new("sqlite::memory:").await.unwrap();
            db.initialize().await.unwrap();
            let db = Arc::new(db);
            let insight = RateLimiter::new(db.clone(), "ai-insight", &RateLimitConfig::default());
            let sources =
                RateLimiter::new(db.clone(), "ai-insight-sources", &RateLimitConfig::default());
            let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 5).unwrap();

            for _ in 0..5 {
                insight.check_at("1.1.1.1", now).await.unwrap();
            }
            assert!(!insight.check_at("1.1.1.1", now).await.unwrap());
            assert!(sources.check_at("1.1.1.1", now).await.unwrap());
        }

        #[tokio::test]
        async fn test_next_window_resets() {
            let (limiter, _db) = create_limiter("ai-insight").await;
            let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
            let end_of_window = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 59).unwrap();
            let next_window = Utc.with_ymd_and_hms(2024, 5, 1, 12, 1, 0).unwrap();

            for _ in 0..5 {
                limiter.check_at("ip", start).await.unwrap();
            }
            assert!(!limiter.check_at("ip", end_of_window).await.unwrap());
            assert!(limiter.check_at("ip", next_window).await.unwrap());
        }

        #[tokio::test]
        async fn test_check_uses_current_time() {
            let (limiter, _db) = create_limiter("ai-insight").await;
            let result = limiter.check("ip").await;
            assert_ok!(&result);
            assert!(result.unwrap());
        }

        #[tokio::test]
        async fn test_store_failure_propagates() {
            // No tables: the counter statement fails
            let db = Database::new("sqlite::memory:").await.unwrap();
            let limiter = RateLimiter::new(Arc::new(db), "x", &RateLimitConfig::default());
            assert_err!(limiter.check("ip").await);
        }
    }
}
