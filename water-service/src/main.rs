use anyhow::Result;
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use water_client::CacheStore;
use water_service::{
    config::AppConfig,
    http, metrics_server, observability,
    pipeline::UsagePipeline,
    sources,
    transform::UsageExtractor,
};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    // Load configuration
    let cfg = AppConfig::load()?;

    // Start metrics server if configured
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    if cfg.credentials.is_none() {
        tracing::warn!(
            "EBMUD_EMAIL / EBMUD_PASSWORD not set; /water/daily will fail until they are"
        );
    }

    let retriever = sources::from_config(&cfg);
    let pipeline = UsagePipeline::new(
        retriever,
        UsageExtractor::new(cfg.extractor.usage_columns.clone()),
        CacheStore::new(cfg.cache.path.clone(), cfg.cache.ttl()),
    );
    let app = http::router(Arc::new(pipeline));

    let ip: IpAddr = cfg
        .server
        .bind_host
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid server.bind_host '{}': {e}", cfg.server.bind_host))?;
    let addr = SocketAddr::new(ip, cfg.server.port);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        %addr,
        retriever = ?cfg.retriever.kind,
        cache = %cfg.cache.path.display(),
        "water service listening"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
