mod alerts;
mod control;
mod overlay;
mod problem;
mod reconciler;
mod retry;
mod router;
mod security;
mod telemetry;
mod trigger;
mod webhook;

#[cfg(test)]
mod test_support;

use std::net::SocketAddr;

use overlay_alerts_storage::Database;
use overlay_alerts_util::{load_env_file, AppConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let storage =
        Database::connect_with(&config.database.url, config.database.max_connections).await?;
    storage.run_migrations().await?;
    info!(stage = "app", database = %config.database.url, "database ready");

    let addr: SocketAddr = config.bind_addr;
    let environment = config.environment;
    let state = router::AppState::new(config, metrics, storage);
    let _retry = state.retry_scheduler().spawn();

    info!(stage = "app", %addr, env = %environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        router::app_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|err| err.into())
}
