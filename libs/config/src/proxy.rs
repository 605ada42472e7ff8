//! The proxy configuration record.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default port the proxy listens on.
pub const DEFAULT_LISTEN_PORT: u16 = 8080;

/// Default target port set.
pub const DEFAULT_TARGET_PORTS: [u16; 3] = [3000, 3001, 3002];

/// Used when the target set is empty.
pub const DEFAULT_TARGET_PORT: u16 = 3000;

/// Persisted proxy configuration.
///
/// Invariant: whenever `target_ports` is non-empty, `current_target_port` is
/// one of its members. Every mutator below maintains it; [`ProxyConfig::normalize`]
/// repairs records loaded from disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// Port the proxy accepts connections on.
    pub listen_port: u16,
    /// Candidate target ports, unique and ascending.
    pub target_ports: BTreeSet<u16>,
    /// Target port used for new connections.
    pub current_target_port: u16,
    /// Whether the proxy should be running.
    pub is_enabled: bool,
    /// Enable the proxy automatically when the daemon launches.
    pub auto_start: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            target_ports: DEFAULT_TARGET_PORTS.into_iter().collect(),
            current_target_port: DEFAULT_TARGET_PORT,
            is_enabled: false,
            auto_start: false,
        }
    }
}

impl ProxyConfig {
    /// Add a target port. Duplicates are ignored.
    pub fn add_target_port(&mut self, port: u16) -> Result<(), ConfigError> {
        if port == 0 {
            return Err(ConfigError::InvalidPort(port));
        }
        let was_empty = self.target_ports.is_empty();
        self.target_ports.insert(port);
        if was_empty {
            self.current_target_port = port;
        }
        Ok(())
    }

    /// Remove a target port.
    ///
    /// Removing the active port moves the active port to the first remaining
    /// one. Returns whether the port was present.
    pub fn remove_target_port(&mut self, port: u16) -> bool {
        if !self.target_ports.remove(&port) {
            return false;
        }
        if self.current_target_port == port {
            if let Some(first) = self.target_ports.first() {
                self.current_target_port = *first;
            }
        }
        true
    }

    /// Whether `port` is a member of the target set.
    pub fn is_valid_target_port(&self, port: u16) -> bool {
        self.target_ports.contains(&port)
    }

    /// Make `port` the active target. It must already be in the target set.
    pub fn set_active_target_port(&mut self, port: u16) -> Result<(), ConfigError> {
        if !self.is_valid_target_port(port) {
            return Err(ConfigError::UnknownTargetPort {
                port,
                known: self.target_ports.iter().copied().collect(),
            });
        }
        self.current_target_port = port;
        Ok(())
    }

    /// Change the listen port.
    pub fn set_listen_port(&mut self, port: u16) -> Result<(), ConfigError> {
        if port == 0 {
            return Err(ConfigError::InvalidPort(port));
        }
        self.listen_port = port;
        Ok(())
    }

    /// Flip `is_enabled` and return the new value.
    pub fn toggle_enabled(&mut self) -> bool {
        self.is_enabled = !self.is_enabled;
        self.is_enabled
    }

    pub fn set_auto_start(&mut self, enabled: bool) {
        self.auto_start = enabled;
    }

    /// Repair a record read from disk.
    ///
    /// Drops port 0 from the target set and moves an active port that is not
    /// in the set to the first member. Returns whether anything changed.
    pub fn normalize(&mut self) -> bool {
        let mut changed = self.target_ports.remove(&0);
        if !self.target_ports.is_empty() && !self.is_valid_target_port(self.current_target_port)
        {
            if let Some(first) = self.target_ports.first() {
                self.current_target_port = *first;
                changed = true;
            }
        }
        changed
    }

    /// The active target port, if the target set is non-empty.
    pub fn active_target(&self) -> Option<u16> {
        if self.target_ports.is_empty() {
            None
        } else {
            Some(self.current_target_port)
        }
    }
}
