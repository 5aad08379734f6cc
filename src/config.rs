use serde::Deserialize;
use std::path::Path;

use crate::error::Error;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub populate: PopulateConfig,
    #[serde(default)]
    pub cron: CronConfig,
    #[serde(default)]
    pub mediastack: MediastackConfig,
    #[serde(default)]
    pub exa: ExaConfig,
    #[serde(default)]
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub insight: InsightConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Public base URL, used for logging and self-referential links
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

fn default_bind() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_database_url() -> String {
    "sqlite:epigram.db?mode=rwc".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            base_url: default_base_url(),
            database_url: default_database_url(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PopulateConfig {
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,
    #[serde(default = "default_per_topic_limit")]
    pub per_topic_limit: u32,
    #[serde(default = "default_excluded_hosts")]
    pub excluded_hosts: Vec<String>,
    /// Number of topics fetched in parallel
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Run the job in-process every N minutes; unset leaves it to the external cron
    #[serde(default)]
    pub interval_minutes: Option<u64>,
}

fn default_topics() -> Vec<String> {
    [
        "general",
        "business",
        "entertainment",
        "health",
        "science",
        "sports",
        "technology",
    ]
    .iter()
    .map(|t| t.to_string())
    .collect()
}

fn default_per_topic_limit() -> u32 {
    25
}

fn default_excluded_hosts() -> Vec<String> {
    ["ycombinator.com", "news.ycombinator.com", "jobs.ashbyhq.com"]
        .iter()
        .map(|h| h.to_string())
        .collect()
}

fn default_concurrency() -> usize {
    3
}

impl Default for PopulateConfig {
    fn default() -> Self {
        Self {
            topics: default_topics(),
            per_topic_limit: default_per_topic_limit(),
            excluded_hosts: default_excluded_hosts(),
            concurrency: default_concurrency(),
            interval_minutes: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CronConfig {
    #[serde(default = "default_secret_header")]
    pub header_name: String,
    #[serde(default)]
    pub secret: Option<String>,
}

fn default_secret_header() -> String {
    "x-epigram-cron-secret".to_string()
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            header_name: default_secret_header(),
            secret: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MediastackConfig {
    #[serde(default = "default_mediastack_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
}

fn default_mediastack_url() -> String {
    "https://api.mediastack.com".to_string()
}

impl Default for MediastackConfig {
    fn default() -> Self {
        Self {
            base_url: default_mediastack_url(),
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExaConfig {
    #[serde(default = "default_exa_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    /// Results requested from the search endpoint
    #[serde(default = "default_search_results")]
    pub search_results: u32,
}

fn default_exa_url() -> String {
    "https://api.exa.ai".to_string()
}

fn default_search_results() -> u32 {
    5
}

impl Default for ExaConfig {
    fn default() -> Self {
        Self {
            base_url: default_exa_url(),
            api_key: String::new(),
            search_results: default_search_results(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OpenAiConfig {
    #[serde(default = "default_openai_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_openai_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_url(),
            api_key: String::new(),
            model: default_model(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_max_requests() -> u64 {
    5
}

fn default_window_secs() -> u64 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct InsightConfig {
    /// Upper bound on a single generation, in seconds
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,
    /// Memoized insight lifetime, in seconds
    #[serde(default = "default_memo_ttl_secs")]
    pub memo_ttl_secs: u64,
}

fn default_max_duration_secs() -> u64 {
    30
}

fn default_memo_ttl_secs() -> u64 {
    60 * 60 * 24
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: default_max_duration_secs(),
            memo_ttl_secs: default_memo_ttl_secs(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Parse config from a TOML string (useful for testing)
    pub fn from_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Load the file when it exists, otherwise start from defaults, then
    /// apply environment overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let mut config = if path.as_ref().exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply deployment overrides from a variable lookup (the process
    /// environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MEDIASTACK_API_KEY") {
            self.mediastack.api_key = v;
        }
        if let Some(v) = lookup("EXA_API_KEY") {
            self.exa.api_key = v;
        }
        if let Some(v) = lookup("OPENAI_API_KEY") {
            self.openai.api_key = v;
        }
        if let Some(v) = lookup("OPENAI_MODEL_NAME").filter(|v| !v.is_empty()) {
            self.openai.model = v;
        }
        if let Some(v) = lookup("EPIGRAM_SECRET_HEADER_NAME") {
            self.cron.header_name = v;
        }
        if let Some(v) = lookup("EPIGRAM_CRON_SECRET") {
            self.cron.secret = Some(v);
        }
        if let Some(v) = lookup("PER_TOPIC_NEWS_LIMIT") {
            self.populate.per_topic_limit = v
                .parse()
                .map_err(|e| Error::Config(format!("PER_TOPIC_NEWS_LIMIT must be a number: {}", e)))?;
        }
        if let Some(v) = lookup("DATABASE_URL") {
            self.server.database_url = v;
        }
        if let Some(v) = lookup("BASE_URL") {
            self.server.base_url = v;
        }
        Ok(())
    }
}
