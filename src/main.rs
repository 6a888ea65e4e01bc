use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use runboard::engine::{AllocationBudget, Engine};
use runboard::limits::DEFAULT_MAX_REALLOCATION_DEPTH;
use runboard::loader::Snapshot;
use runboard::notify::NotifyHub;
use runboard::wire;

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = env_parse("RUNBOARD_METRICS_PORT");
    runboard::observability::init(metrics_port);

    let port = std::env::var("RUNBOARD_PORT").unwrap_or_else(|_| "7433".into());
    let bind = std::env::var("RUNBOARD_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = PathBuf::from(std::env::var("RUNBOARD_DATA_DIR").unwrap_or_else(|_| "./data".into()));
    let snapshot_path = std::env::var("RUNBOARD_SNAPSHOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir.join("snapshot.json"));
    let max_connections: usize = env_parse("RUNBOARD_MAX_CONNECTIONS").unwrap_or(64);
    let budget = AllocationBudget {
        max_depth: env_parse("RUNBOARD_MAX_REALLOC_DEPTH").unwrap_or(DEFAULT_MAX_REALLOCATION_DEPTH),
        max_displacements: env_parse("RUNBOARD_MAX_DISPLACEMENTS"),
    };

    std::fs::create_dir_all(&data_dir)?;

    let snapshot = match Snapshot::from_file(&snapshot_path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("no snapshot at {}, starting with an empty registry", snapshot_path.display());
            Snapshot::default()
        }
        Err(e) => return Err(format!("snapshot {}: {e}", snapshot_path.display()).into()),
    };
    let engine = Arc::new(
        Engine::new(data_dir.join("occupancy.wal"), snapshot, Arc::new(NotifyHub::new()))?
            .with_budget(budget),
    );
    info!("loaded {}", engine.load_report());

    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("runboard listening on {addr}");
    info!("  data_dir: {}", data_dir.display());
    info!("  max_connections: {max_connections}");
    info!(
        "  budget: depth {}, displacements {}",
        budget.max_depth,
        budget
            .max_displacements
            .map_or("runs x stay".to_string(), |n| n.to_string())
    );
    info!("  metrics: {}", metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
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
                        warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(runboard::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(runboard::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(runboard::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, engine).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(runboard::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
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
                warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    info!("{} journal events pending checkpoint", engine.journal_pending().await);
    info!("runboard stopped");
    Ok(())
}
