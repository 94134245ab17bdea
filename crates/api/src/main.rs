use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use catalogflow_infra::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    catalogflow_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let cancel = CancellationToken::new();

    let services = Arc::new(
        catalogflow_api::app::services::build_services(&config, cancel.clone()).await?,
    );
    let app = catalogflow_api::app::build_app(Arc::clone(&services));

    let listener = tokio::net::TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_addr))?;

    tracing::info!(
        addr = %listener.local_addr()?,
        backend = services.backend.as_str(),
        "listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await
        .context("server error")?;

    cancel.cancel();
    services.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
            }
            tracing::info!("shutdown requested");
        }
        _ = cancel.cancelled() => {}
    }
}
