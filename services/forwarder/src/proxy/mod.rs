//! Local TCP forwarding core.
//!
//! This module provides:
//! - The listener that accepts connections on the listen port
//! - Per-connection relays to `127.0.0.1:<target port>`
//! - Runtime target switching for new connections
//! - A health supervisor with bounded, backed-off auto restart
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Relay -> 127.0.0.1:<target port>
//!              ^
//!              | stop / start
//!       Health Supervisor (probe, failure counter, restart)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{ChannelSink, ProxyServer};
//!
//! let (sink, mut events) = ChannelSink::new();
//! let server = ProxyServer::new(sink);
//! server.start(8080, 3000).await;
//! server.switch_target(3001)?;
//! ```

mod error;
mod events;
mod health;
mod relay;
mod server;

pub use error::ProxyError;
pub use events::{ChannelSink, EventSink, LogSink, ProxyEvent, Tee};
pub use health::{probe_target, HealthConfig, HealthStatus, RestartReason};
pub use relay::{Relay, RelayHandle, RelayId, RelayObserver, RelayOutcome, CHUNK_SIZE};
pub use server::{ProxyServer, ServerOptions, ServerState, TARGET_HOST};

use tokio::sync::watch;

/// Resolve once the flag is raised or its sender is dropped.
pub(crate) async fn signalled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|raised| *raised).await;
}
