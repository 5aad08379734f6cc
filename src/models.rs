use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// An extracted news article as stored in a topic bucket and served by the feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub title: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub url: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub text: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub favicon: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub published_date: String,
    /// Provider fields we don't model (author, score, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Article {
    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        parse_published_date(&self.published_date)
    }
}

/// One entry of the news-listing response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ListingEntry {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub published_at: Option<String>,
}

/// A document handed to the insight generator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Source {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub url: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
}

impl From<Article> for Source {
    fn from(article: Article) -> Self {
        let non_empty = |s: String| if s.is_empty() { None } else { Some(s) };
        Source {
            url: article.url,
            text: article.text,
            title: non_empty(article.title),
            favicon: non_empty(article.favicon),
        }
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Parse the publish dates providers hand us: RFC 3339, the compact
/// `YYYYMMDDHHmm` form, or a bare `YYYY-MM-DD`.
pub fn parse_published_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    if raw.len() == 12 && raw.bytes().all(|b| b.is_ascii_digit()) {
        return NaiveDateTime::parse_from_str(raw, "%Y%m%d%H%M")
            .ok()
            .map(|dt| dt.and_utc());
    }

    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt.and_utc());
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}
