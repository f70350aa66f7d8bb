use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

use roomslot::catalog::Catalog;
use roomslot::config::Config;
use roomslot::engine::Engine;
use roomslot::store::LocalStore;
use roomslot::{reaper, request};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries command responses.
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let config = Config::from_env();
    roomslot::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let store = Arc::new(LocalStore::open(&config.journal_path())?);
    let engine = Arc::new(Engine::open(store.clone(), Catalog::reference(), config.engine()).await?);

    info!("roomslot ready");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  rooms: {}", engine.catalog().len());
    info!("  hold_ttl: {}s", config.hold_ttl.as_secs());
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    tokio::spawn(reaper::run_reaper(engine.clone(), config.reaper_interval));
    tokio::spawn(reaper::run_compactor(
        store.clone(),
        config.compact_threshold,
        Duration::from_secs(30),
    ));

    // Graceful shutdown: stop reading on SIGTERM/ctrl-c or EOF.
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
                    tracing::warn!("no SIGTERM handler: {e}");
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

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("stdin closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = request::handle_line(&engine, &line).await;
                stdout.write_all(format!("{response}\n").as_bytes()).await?;
                stdout.flush().await?;
            }
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    if let Err(e) = store.compact().await {
        tracing::warn!("final compaction failed: {e}");
    }
    info!("roomslot stopped");
    Ok(())
}
