//! Tallyd daemon entry point.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::signal;
use tokio::sync::watch;

mod alert;
mod config;
mod error;
mod geo;
mod history;
mod lifecycle;
mod merge;
mod runtime;
mod sampler;
mod scheduler;
mod store;
mod types;
mod watchdog;

use alert::{AlertSink, LogAlerts, WebhookAlerts};
use config::Config;
use geo::MaxmindLookup;
use runtime::{ContainerRuntime, DockerRuntime};
use sampler::{LocalAddrs, TcpdumpCapture};
use scheduler::Tracker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting tallyd with config: {:?}", cfg);

    let local = match cfg.local_ip {
        Some(ip) => LocalAddrs::new(vec![ip]),
        None => LocalAddrs::discover().await,
    };
    let capture = TcpdumpCapture::new(
        cfg.capture_interface.clone(),
        local,
        Duration::from_secs(cfg.capture_grace_secs),
    );

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(300))
        .build()?;

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::new(
        cfg.instance_prefix.clone(),
        cfg.network_name.clone(),
        cfg.status_port,
        cfg.status_path.clone(),
    )?);

    let alerts: Arc<dyn AlertSink> = match &cfg.alert_webhook {
        Some(url) => Arc::new(WebhookAlerts::new(http.clone(), url.clone())),
        None => Arc::new(LogAlerts),
    };

    let lookup = MaxmindLookup::open(&cfg.geo_db_path);
    let stop_grace = Duration::from_secs(cfg.capture_secs + cfg.capture_grace_secs + 30);
    let tracker = Tracker::new(
        cfg,
        Box::new(capture),
        Box::new(lookup),
        runtime,
        alerts,
        http,
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tracker_handle = tokio::spawn(tracker.run(shutdown_rx));

    // Graceful Shutdown
    tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal, finishing current window...");
        }
        res = &mut tracker_handle => {
            if let Err(e) = res {
                error!("Tracker task failed: {}", e);
            }
            return Ok(());
        }
    }

    let _ = shutdown_tx.send(true);
    match tokio::time::timeout(stop_grace, tracker_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Tracker task failed: {}", e),
        Err(_) => warn!("Tracker did not stop within {:?}", stop_grace),
    }

    info!("Shutdown complete.");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("Unable to listen for SIGTERM: {}", e);
                if let Err(e) = signal::ctrl_c().await {
                    error!("Unable to listen for shutdown signal: {}", e);
                }
                return;
            }
        };
        tokio::select! {
            res = signal::ctrl_c() => {
                if let Err(e) = res {
                    error!("Unable to listen for shutdown signal: {}", e);
                }
            }
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    if let Err(e) = signal::ctrl_c().await {
        error!("Unable to listen for shutdown signal: {}", e);
    }
}
