//! Drives the proxy server from the persisted configuration.
//!
//! On launch the controller honors `autoStart`, then applies the record. The
//! config file is polled afterwards and differences are translated into
//! start, stop and switch calls. When the server gives up on automatic
//! restart the controller persists `isEnabled = false` so the file reflects
//! what is actually running.

use std::time::Duration;

use anyhow::{Context, Result};
use portswitch_config::{ConfigStore, ProxyConfig};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::proxy::{signalled, ProxyEvent, ProxyServer};

pub struct ConfigController {
    store: ConfigStore,
    server: ProxyServer,
    applied: Option<ProxyConfig>,
}

impl ConfigController {
    pub fn new(store: ConfigStore, server: ProxyServer) -> Self {
        Self {
            store,
            server,
            applied: None,
        }
    }

    pub fn server(&self) -> &ProxyServer {
        &self.server
    }

    /// Last record handed to the server.
    pub fn applied(&self) -> Option<&ProxyConfig> {
        self.applied.as_ref()
    }

    /// Load the record, honor `autoStart`, and apply it.
    ///
    /// An unreadable file falls back to the defaults without overwriting it.
    pub async fn launch(&mut self) -> Result<ProxyConfig> {
        let mut config = match self.store.load() {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    error = %e,
                    path = %self.store.path().display(),
                    "Failed to load proxy config, using defaults"
                );
                ProxyConfig::default()
            }
        };

        if config.auto_start && !config.is_enabled {
            info!("Auto start enabled, enabling proxy");
            config.is_enabled = true;
            self.store
                .save(&config)
                .context("Failed to persist auto start")?;
        }

        self.apply(config.clone()).await;
        Ok(config)
    }

    /// Bring the server in line with `config`.
    ///
    /// Returns the names of the fields that caused an action.
    pub async fn apply(&mut self, config: ProxyConfig) -> Vec<&'static str> {
        let previous = self.applied.take();
        let mut changed = Vec::new();

        let was_enabled = previous.as_ref().is_some_and(|p| p.is_enabled);
        let target = config.active_target();

        match (config.is_enabled, target) {
            (false, _) => {
                if was_enabled || previous.is_none() {
                    changed.push("is_enabled");
                    self.server.stop();
                }
            }
            (true, None) => {
                warn!("Proxy enabled but no target port configured");
                changed.push("target_ports");
                self.server.stop();
            }
            (true, Some(target)) => {
                let previous_target = previous.as_ref().and_then(ProxyConfig::active_target);
                match previous.as_ref() {
                    Some(prev) if was_enabled && previous_target.is_some() => {
                        if prev.listen_port != config.listen_port {
                            changed.push("listen_port");
                            info!(
                                from = prev.listen_port,
                                to = config.listen_port,
                                "Listen port changed, restarting proxy"
                            );
                            self.server.stop();
                            self.server.start(config.listen_port, target).await;
                        } else if previous_target != Some(target) {
                            changed.push("current_target_port");
                            if let Err(e) = self.server.switch_target(target) {
                                warn!(error = %e, "Failed to switch target");
                            }
                        }
                    }
                    _ => {
                        changed.push("is_enabled");
                        self.server.start(config.listen_port, target).await;
                    }
                }
            }
        }

        if !changed.is_empty() {
            info!(
                changed = ?changed,
                listen_port = config.listen_port,
                target_port = config.current_target_port,
                is_enabled = config.is_enabled,
                "Applied proxy config"
            );
        }

        self.applied = Some(config);
        changed
    }

    /// Re-read the file and apply it if it differs from what is applied.
    pub async fn reload(&mut self) -> Result<Vec<&'static str>> {
        let config = self.store.load().context("Failed to reload proxy config")?;
        if self.applied.as_ref() == Some(&config) {
            return Ok(Vec::new());
        }
        Ok(self.apply(config).await)
    }

    /// React to a server notification.
    pub fn handle_event(&mut self, event: &ProxyEvent) -> Result<()> {
        let ProxyEvent::FailedToStart { error } = event else {
            return Ok(());
        };
        if !error.is_terminal() {
            return Ok(());
        }

        warn!(error = %error, "Proxy unavailable, disabling");
        let mut config = self
            .store
            .load()
            .context("Failed to load proxy config")?;
        config.is_enabled = false;
        self.store
            .save(&config)
            .context("Failed to persist disabled proxy")?;

        if let Some(applied) = self.applied.as_mut() {
            applied.is_enabled = false;
        }
        Ok(())
    }

    /// Poll the config file and consume server notifications until shutdown.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ProxyEvent>,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            path = %self.store.path().display(),
            poll_interval_ms = poll_interval.as_millis() as u64,
            "Watching proxy config"
        );

        loop {
            tokio::select! {
                biased;
                _ = signalled(&mut shutdown) => {
                    debug!("Config controller stopping");
                    return Ok(());
                }
                Some(event) = events.recv() => {
                    if let Err(e) = self.handle_event(&event) {
                        error!(error = %e, event = event.kind(), "Failed to handle proxy event");
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.reload().await {
                        warn!(error = %e, "Config reload failed");
                    }
                }
            }
        }
    }
}
