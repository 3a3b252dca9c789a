use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use slotward::auth::SlotwardAuthSource;
use slotward::config::ServerConfig;
use slotward::dispatch::{self, LogNotifier};
use slotward::engine::{Engine, InMemoryCache};
use slotward::notify::NotifyHub;
use slotward::observability;
use slotward::reaper;
use slotward::wire::{self, SlotwardFactory};

const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = ServerConfig::from_env();
    observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;

    let engine = Arc::new(Engine::open(
        config.wal_path(),
        Arc::new(NotifyHub::new()),
        config.engine_settings(),
        Arc::new(InMemoryCache::new()),
    )?);
    metrics::gauge!(observability::PAGES_ACTIVE).set(engine.page_count() as f64);

    tokio::spawn(dispatch::run_dispatcher(engine.clone(), Arc::new(LogNotifier)));
    tokio::spawn(reaper::run_cache_sweeper(engine.clone(), CACHE_SWEEP_INTERVAL));
    tokio::spawn(reaper::run_compactor(engine.clone(), config.compact_threshold));

    let factory = Arc::new(SlotwardFactory::new(
        engine.clone(),
        SlotwardAuthSource::new(config.public.clone(), config.admin.clone()),
        config.admin.user.clone(),
        config.request_timeout,
    ));
    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("slotward listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  pages loaded: {}", engine.page_count());
    info!("  max_connections: {max_connections}");
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Stop accepting on SIGTERM/ctrl-c, then drain in-flight connections.
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("cannot register SIGTERM handler: {e}");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    tracing::warn!("connection limit reached, rejecting {peer}");
                    metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                    drop(socket);
                    continue;
                };

                info!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let factory = factory.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = wire::process_connection(socket, factory).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(DRAIN_TIMEOUT);
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    info!("slotward stopped");
    Ok(())
}
