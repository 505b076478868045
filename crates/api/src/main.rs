use std::sync::Arc;

use ledgerline_api::app::{self, services};
use ledgerline_api::config::ApiConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ledgerline_observability::init();

    let config = ApiConfig::from_env()?;
    let services = Arc::new(services::build_services(&config).await?);
    let executor = services.spawn_executor();

    let app = app::build_app(services);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("http server stopped; draining transfer workers");
    executor.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
