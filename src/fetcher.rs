use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::config::{ExaConfig, MediastackConfig};
use crate::error::{Error, Result};
use crate::models::{Article, ListingEntry};

const MEDIASTACK: &str = "mediastack";
const EXA: &str = "exa";

/// Client for the news-listing and content-extraction APIs.
pub struct Fetcher {
    client: Client,
    mediastack: MediastackConfig,
    exa: ExaConfig,
}

#[derive(Deserialize)]
struct ListingResponse {
    data: Option<Vec<ListingEntry>>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ContentsResponse {
    #[serde(default)]
    results: Vec<Article>,
}

impl Fetcher {
    pub fn new(mediastack: MediastackConfig, exa: ExaConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("Epigram/1.0 (News Aggregator)")
            .build()?;

        Ok(Self {
            client,
            mediastack,
            exa,
        })
    }

    /// Latest US English headlines for one category.
    pub async fn list_news(&self, topic: &str, limit: u32) -> Result<Vec<ListingEntry>> {
        let url = format!("{}/v1/news", self.mediastack.base_url.trim_end_matches('/'));
        debug!("Listing '{}' news (limit {})", topic, limit);
        let limit = limit.to_string();

        let response = self
            .client
            .get(&url)
            .query(&[
                ("access_key", self.mediastack.api_key.as_str()),
                ("languages", "en"),
                ("countries", "us"),
                ("categories", topic),
                ("limit", limit.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::from_response(MEDIASTACK, response).await);
        }

        let body: ListingResponse = response.json().await?;
        match (body.data, body.error) {
            (Some(data), _) => Ok(data),
            (None, Some(error)) => Err(Error::InvalidResponse {
                service: MEDIASTACK,
                message: error.to_string(),
            }),
            (None, None) => Err(Error::InvalidResponse {
                service: MEDIASTACK,
                message: "response has no data field".to_string(),
            }),
        }
    }

    /// Full text for each URL. The provider may return fewer results than
    /// URLs requested.
    pub async fn get_contents(&self, urls: &[String]) -> Result<Vec<Article>> {
        if urls.is_empty() {
            return Ok(Vec::new());
        }

        let body = json!({
            "urls": urls,
            "text": true,
            "summary": true,
        });
        let results = self.post_exa("contents", &body).await?;
        info!("Extracted {} of {} articles", results.len(), urls.len());
        Ok(results)
    }

    /// Articles relevant to a free-text query.
    pub async fn search_contents(&self, query: &str) -> Result<Vec<Article>> {
        let body = json!({
            "query": query,
            "type": "auto",
            "numResults": self.exa.search_results,
            "contents": { "text": true },
        });
        self.post_exa("search", &body).await
    }

    async fn post_exa(&self, endpoint: &str, body: &serde_json::Value) -> Result<Vec<Article>> {
        let url = format!("{}/{}", self.exa.base_url.trim_end_matches('/'), endpoint);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.exa.api_key)
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::from_response(EXA, response).await);
        }

        let parsed: ContentsResponse = response.json().await?;
        Ok(parsed.results)
    }
}
