use chrono::Utc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sessionkeeper_backend::{config::Config, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sessionkeeper_backend=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    let state = AppState::from_config(config).await?;

    let report = state.cleaner().sweep(Utc::now()).await;
    for (target, removed) in &report.removed {
        if *removed > 0 {
            tracing::info!(
                partition = %target.partition,
                kind = %target.kind,
                "Deleted {} expired entries",
                removed
            );
        }
    }
    for target in &report.skipped {
        tracing::info!(partition = %target.partition, "Skipped, storage expires entries natively");
    }
    if report.cache_removed > 0 {
        tracing::info!("Evicted {} expired cache entries", report.cache_removed);
    }
    Ok(())
}
