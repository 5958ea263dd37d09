// proxy: Library entry point.
// Exposes modules for integration testing.

pub mod config;
pub mod egress;
pub mod gateway;
pub mod identity;
pub mod ingress;
pub mod pending;
pub mod pool;
pub mod relay;
pub mod windows;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use crate::config::ProxyConfig;
use crate::gateway::GatewayState;
use crate::ingress::Ingress;
use crate::pending::PendingTable;
use crate::pool::RelayPool;
use crate::relay::AlreadyHaveEvent;
use crate::windows::Windows;

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Identity(#[from] identity::IdentityError),
    #[error("no initial relay reachable")]
    NoRelaysConnected,
    #[error("binding {addr}: {source}")]
    Bind { addr: String, source: std::io::Error },
    #[error("HTTP server: {0}")]
    Serve(std::io::Error),
}

/// Run the proxy until `shutdown` fires (or forever if it never does).
///
/// Startup order: identity, relay pool with its shared subscription, ingest
/// and maintenance tasks, connectivity probe, HTTP listener. On shutdown the
/// background tasks are stopped and every relay connection closed.
pub async fn run(cfg: ProxyConfig, mut shutdown: watch::Receiver<bool>) -> Result<(), RunError> {
    let keys = Arc::new(identity::load_identity(cfg.nsec_file.as_deref(), cfg.save_nsec)?);

    let now = windows::now_unix();
    let since = now - windows::SUBSCRIPTION_LOOKBACK_SECS;
    let windows = Arc::new(Windows::new(now));
    let already_have: AlreadyHaveEvent = {
        let windows = windows.clone();
        Arc::new(move |event_id: &str| windows.already_have_event(event_id))
    };

    let (pool, ingest_rx) = RelayPool::connect(
        cfg.relays.clone(),
        keys.public_key_hex().to_owned(),
        since,
        cfg.max_cached_relays,
        already_have,
    );
    let pool = Arc::new(pool);
    let pending = Arc::new(PendingTable::new());

    let ingress = Ingress::new(keys.clone(), windows.clone(), pending.clone());
    let ingress_task = tokio::spawn(ingress.run(ingest_rx));
    let maintenance_task = tokio::spawn(windows::run_maintenance(windows.clone(), pool.clone()));

    // Give the initial relays a moment to come up; a proxy that can reach
    // none of its configured relays is better off failing loudly than
    // timing out every request. Hint-relay-only setups skip the probe.
    if !cfg.relays.is_empty() {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if pool.connected_count() == 0 {
            tokio::time::sleep(Duration::from_secs(5)).await;
            if pool.connected_count() == 0 {
                ingress_task.abort();
                maintenance_task.abort();
                pool.close_all();
                return Err(RunError::NoRelaysConnected);
            }
        }
        info!(connected = pool.connected_count(), total = cfg.relays.len(), "initial relays up");
    }

    let state = Arc::new(GatewayState {
        keys,
        pool: pool.clone(),
        pending,
        keep_host: cfg.keep_host,
        timeout: Duration::from_millis(cfg.timeout_ms),
        destination: cfg.destination.clone(),
    });
    let app = gateway::router(state);

    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| RunError::Bind { addr: addr.clone(), source })?;
    info!(addr = %addr, "HTTP listener up");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if shutdown.changed().await.is_ok() {
                info!("shutdown signal received");
            } else {
                // No shutdown source configured; serve forever.
                std::future::pending::<()>().await
            }
        })
        .await
        .map_err(RunError::Serve)?;

    maintenance_task.abort();
    ingress_task.abort();
    pool.close_all();
    info!("shutdown complete");
    Ok(())
}
