use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use wavelog::config::Config;
use wavelog::metrics;
use wavelog::oauth::SpotifyOAuth;
use wavelog::queue::RequestQueue;
use wavelog::store::Store;
use wavelog::sync::SyncRunner;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wavelog=info")),
        )
        .init();

    let config = Config::load()?;
    metrics::init_metrics();

    let db_path = config.database.resolve_path()?;
    let store = Arc::new(Store::open(&db_path)?);
    tracing::info!("Library database at {}", db_path.display());

    let queue = RequestQueue::new();
    let oauth = Arc::new(SpotifyOAuth::new(&config.spotify));
    let runner = SyncRunner::new(
        store,
        queue,
        oauth,
        config.spotify.clone(),
        &config.sync,
    );

    tracing::info!(
        "Starting sync loop (poll interval {}s)",
        config.sync.poll_interval_secs
    );

    tokio::select! {
        _ = runner.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    Ok(())
}
