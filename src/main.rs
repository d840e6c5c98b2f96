use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use slotgate::admission::AdmissionController;
use slotgate::cache::{CapacityCache, Counters, MemoryCounters, RespCounters};
use slotgate::config::Config;
use slotgate::ledger::Ledger;
use slotgate::maintenance;
use slotgate::observability::{CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED_TOTAL, CONNECTIONS_TOTAL};
use slotgate::pool::PoolModel;
use slotgate::wire::{self, SlotgateFactory};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    slotgate::observability::init(config.metrics_port)?;

    let tls_acceptor =
        slotgate::tls::load_tls_acceptor(config.tls_cert.as_deref(), config.tls_key.as_deref())?;

    let model = Arc::new(PoolModel::load(&config.pools_path)?);
    info!(
        "loaded {} pools ({} grids) from {}",
        model.pools().count(),
        model.grids().len(),
        config.pools_path.display()
    );

    std::fs::create_dir_all(&config.data_dir)?;
    let ledger = Ledger::open(&config.wal_path())?;

    let counters = match &config.cache_addr {
        Some(addr) => {
            info!("capacity cache: RESP server at {addr}");
            Counters::Resp(RespCounters::new(addr.clone(), config.cache_timeout))
        }
        None => {
            info!("capacity cache: in-process counters");
            Counters::Memory(MemoryCounters::new())
        }
    };
    let cache = CapacityCache::new(counters, config.cache_prefix.clone());
    let controller = Arc::new(AdmissionController::new(model, ledger.clone(), cache));

    // Admission must not trust counters left over from a previous run.
    if let Err(e) = controller.resync_all().await {
        tracing::warn!("startup resync incomplete, requests fall through to the ledger: {e}");
    }

    tokio::spawn(maintenance::run_resyncer(
        controller.clone(),
        config.resync_interval,
        config.full_resync_every,
    ));
    tokio::spawn(maintenance::run_compactor(ledger, config.compact_threshold));

    let factory = Arc::new(SlotgateFactory::new(controller, config.password.clone()));
    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("slotgate listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {max_connections}");
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("no SIGTERM handler ({e}), ctrl-c only");
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

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                tracing::debug!("connection from {peer}");
                metrics::counter!(CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0);
                let factory = factory.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = wire::process_connection(socket, factory, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(std::time::Duration::from_secs(10));
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
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    info!("slotgate stopped");
    Ok(())
}
