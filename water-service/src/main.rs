use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use water_service::{
    api::{self, AppState},
    config::AppConfig,
    metrics_server, notify, observability,
    retry::RetryPolicy,
    store,
};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let retry = RetryPolicy::from_config(&cfg.retry);
    let store = store::open(&cfg.store, retry.clone()).await?;

    if cfg.store.seed_initial {
        let seeded = store::seed_if_empty(store.as_ref(), &cfg.seed).await?;
        if seeded == 0 {
            tracing::info!("store already populated, skipping seed");
        }
    }

    let notifier: Arc<dyn notify::Notifier> = Arc::from(notify::from_config(&cfg.notify, retry)?);
    let state = AppState::new(store, notifier, &cfg);
    if !state.admin_gate_enabled() {
        tracing::warn!("server.admin_token not set; admin routes are open to anyone");
    }

    let addr: SocketAddr = cfg
        .server
        .bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid server.bind_addr: {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "water service listening");

    axum::serve(listener, api::router(state).into_make_service()).await?;
    Ok(())
}
