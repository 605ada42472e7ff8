//! portswitch configuration.
//!
//! This crate owns the persisted proxy configuration consumed by the
//! forwarding daemon:
//!
//! - [`ProxyConfig`]: the `{listenPort, targetPorts, currentTargetPort,
//!   isEnabled, autoStart}` record and the invariants on its target set
//! - [`ConfigStore`]: JSON file persistence with atomic writes
//!
//! The forwarder core never mutates this record; it only receives validated
//! ports taken from it.

pub mod error;
pub mod proxy;
pub mod store;

pub use error::ConfigError;
pub use proxy::{
    ProxyConfig, DEFAULT_LISTEN_PORT, DEFAULT_TARGET_PORT, DEFAULT_TARGET_PORTS,
};
pub use store::ConfigStore;
