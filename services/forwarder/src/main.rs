//! portswitchd
//!
//! Local TCP forwarder with runtime target switching.
//!
//! This daemon:
//! - Listens on the configured port and relays every connection to
//!   `127.0.0.1:<current target port>`
//! - Watches the JSON config file and applies enable, listen port and target
//!   changes while running
//! - Supervises its own health and restarts the listener with backoff

use anyhow::{Context, Result};
use portswitch_config::ConfigStore;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use portswitch_forwarder::config::Config;
use portswitch_forwarder::{ChannelSink, ConfigController, LogSink, ProxyServer, Tee};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to PORTSWITCH_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with((!config.pretty_logs).then(|| tracing_subscriber::fmt::layer().json()))
        .with(config.pretty_logs.then(|| tracing_subscriber::fmt::layer()))
        .init();

    info!("Starting portswitchd");
    info!(
        config_file = %config.config_file.display(),
        bind_ip = %config.bind_ip,
        health_interval_secs = config.health_interval.as_secs(),
        max_retry_attempts = config.max_retry_attempts,
        "Configuration loaded"
    );

    let (events_sink, events) = ChannelSink::new();
    let server = ProxyServer::with_options(
        config.server_options(),
        Tee(vec![Box::new(LogSink), Box::new(events_sink)]),
    );

    let mut controller = ConfigController::new(
        ConfigStore::new(config.config_file.clone()),
        server.clone(),
    );
    let proxy_config = controller
        .launch()
        .await
        .context("Failed to apply proxy configuration")?;
    info!(
        listen_port = proxy_config.listen_port,
        target_port = proxy_config.current_target_port,
        is_enabled = proxy_config.is_enabled,
        "Proxy configuration applied"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let controller_task = tokio::spawn(controller.run(events, config.poll_interval, shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    shutdown_tx.send_replace(true);
    server.shutdown();

    match controller_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Config controller failed"),
        Err(e) => error!(error = %e, "Config controller task panicked"),
    }

    info!("portswitchd stopped");
    Ok(())
}
