use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sessionkeeper_backend::config::Config;
use sessionkeeper_backend::state::AppState;

fn mask_url(url: &str) -> String {
    match url.split_once('@') {
        Some((_, host)) => format!("***@{}", host),
        None => url.to_string(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sessionkeeper_backend=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load()?;
    tracing::info!(
        database_url = %config.database_url.as_deref().map(mask_url).unwrap_or_else(|| "<in-memory>".into()),
        redis_url = %config.redis_url.as_deref().map(mask_url).unwrap_or_else(|| "<in-memory>".into()),
        issuer = %config.issuer,
        session_id_persist_in_cache = config.session_id_persist_in_cache,
        grant_persist_in_cache = config.grant_persist_in_cache,
        key_regeneration_enabled = config.key_regeneration_enabled,
        "Loaded configuration from environment/.env"
    );

    let state = AppState::from_config(config).await?;
    let jobs = state.spawn_maintenance();
    tracing::info!(jobs = jobs.len(), "Session engine started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested, stopping maintenance jobs");
    for job in jobs {
        job.abort();
    }
    Ok(())
}
