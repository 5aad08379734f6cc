use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use epigram::config::Config;
use epigram::db::Database;
use epigram::fetcher::Fetcher;
use epigram::llm::{CompletionModel, OpenAiClient};
use epigram::populate::start_background_populate;
use epigram::routes::{self, AppState};
use epigram::store::NewsStore;

const PURGE_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "epigram=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::var("EPIGRAM_CONFIG").unwrap_or_else(|_| "epigram.toml".to_string());
    let config = Config::load_with_env(&config_path)?;
    info!(
        "Loaded configuration from {} ({} topics)",
        config_path,
        config.populate.topics.len()
    );

    // Initialize database
    let db = Database::new(&config.server.database_url).await?;
    db.initialize().await?;
    info!("Database initialized");

    let db = Arc::new(db);
    tokio::spawn(db.clone().start_background_purge(PURGE_INTERVAL));

    // Upstream clients
    let fetcher = Arc::new(Fetcher::new(config.mediastack.clone(), config.exa.clone())?);
    let model = OpenAiClient::new(config.openai.clone())?;
    info!("Using model {}", model.model());
    let model: Arc<dyn CompletionModel> = Arc::new(model);

    // Create app state
    let store: Arc<dyn NewsStore> = db.clone();
    let state = Arc::new(AppState::new(&config, store, fetcher, model));

    // In-process schedule, for deployments without an external cron
    if let Some(interval) = config.populate.interval_minutes.filter(|m| *m > 0) {
        let populator = state.populator.clone();
        tokio::spawn(async move {
            start_background_populate(populator, interval).await;
        });
    }

    let app = routes::router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!("Server starting on {}", config.server.base_url);

    axum::serve(listener, app).await?;

    Ok(())
}
