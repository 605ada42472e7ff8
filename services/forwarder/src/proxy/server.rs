//! Listener and server lifecycle.
//!
//! The server owns the listening socket and the set of live relays. It
//! accepts connections on the listen port and hands each one to a relay
//! bound to `127.0.0.1:<target port>`, where the target port is read at
//! accept time so switching only affects new connections.
//!
//! Cross-task mutable state is split across independent locks: the
//! lifecycle, the relay set, the retry bookkeeping and the failure counter.
//! No lock is held across an `.await`, and sinks are called with no lock
//! held.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::ProxyError;
use super::events::{EventSink, ProxyEvent};
use super::health::{HealthConfig, RestartReason};
use super::relay::{Relay, RelayHandle, RelayId, RelayObserver};
use super::signalled;

/// Host every relay and probe connects to.
pub const TARGET_HOST: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Consecutive accept errors tolerated before the listener counts as failed.
const MAX_CONSECUTIVE_ACCEPT_ERRORS: u32 = 5;

/// Pause after an accept error to avoid a tight loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Server lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Restarting,
}

/// Options fixed for the lifetime of a server.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Interface the listener binds to.
    pub bind_ip: IpAddr,
    /// Health supervision settings.
    pub health: HealthConfig,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            health: HealthConfig::default(),
        }
    }
}

/// Who asked for a start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum StartOrigin {
    /// External control layer.
    Caller,
    /// Auto-restart sequence for the given retry generation.
    Restart { generation: u64 },
}

/// Tasks belonging to one listener run.
pub(super) struct RunHandle {
    pub(super) shutdown: watch::Sender<bool>,
    pub(super) accept_task: JoinHandle<()>,
}

pub(super) struct Lifecycle {
    pub(super) state: ServerState,
    pub(super) listen_port: u16,
    pub(super) local_addr: Option<SocketAddr>,
    /// Bumped by every start and stop; stale async results compare against it.
    pub(super) epoch: u64,
    pub(super) run: Option<RunHandle>,
}

#[derive(Default)]
pub(super) struct RetryState {
    pub(super) attempt: u32,
    pub(super) restarting: bool,
    pub(super) exhausted: bool,
    /// Bumped when pending restarts are abandoned.
    pub(super) generation: u64,
    pub(super) cancel: Option<watch::Sender<bool>>,
}

#[derive(Default)]
pub(super) struct FailureCounter {
    pub(super) count: u32,
    pub(super) generation: u64,
    pub(super) reset_timer: Option<JoinHandle<()>>,
}

pub(super) struct ServerInner {
    pub(super) options: ServerOptions,
    sink: Box<dyn EventSink>,
    pub(super) lifecycle: Mutex<Lifecycle>,
    pub(super) target_port: AtomicU16,
    relays: Mutex<HashMap<RelayId, RelayHandle>>,
    pub(super) retry: Mutex<RetryState>,
    pub(super) failures: Mutex<FailureCounter>,
    pub(super) health_checks: AtomicU64,
    pub(super) destroyed: watch::Sender<bool>,
}

/// Lock a mutex, recovering the data if a holder panicked.
pub(super) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Local TCP forwarding server.
///
/// Cheap to clone; all clones drive the same server. Dropping the last
/// clone shuts the server down. Must be used from within a Tokio runtime.
#[derive(Clone)]
pub struct ProxyServer {
    inner: Arc<ServerInner>,
    _owner: Arc<OwnerGuard>,
}

/// Shared by every [`ProxyServer`] clone. Background tasks hold only
/// `ServerInner`, so this drops with the last handle.
struct OwnerGuard {
    inner: Arc<ServerInner>,
}

impl Drop for OwnerGuard {
    fn drop(&mut self) {
        if self.inner.destroy() {
            info!("Proxy server dropped, shut down");
        }
    }
}

impl ProxyServer {
    /// Create a stopped server with default options.
    pub fn new(sink: impl EventSink) -> Self {
        Self::with_options(ServerOptions::default(), sink)
    }

    /// Create a stopped server.
    pub fn with_options(options: ServerOptions, sink: impl EventSink) -> Self {
        let (destroyed, _) = watch::channel(false);
        let inner = Arc::new(ServerInner {
            options,
            sink: Box::new(sink),
            lifecycle: Mutex::new(Lifecycle {
                state: ServerState::Stopped,
                listen_port: 0,
                local_addr: None,
                epoch: 0,
                run: None,
            }),
            target_port: AtomicU16::new(0),
            relays: Mutex::new(HashMap::new()),
            retry: Mutex::new(RetryState::default()),
            failures: Mutex::new(FailureCounter::default()),
            health_checks: AtomicU64::new(0),
            destroyed,
        });
        Self {
            _owner: Arc::new(OwnerGuard {
                inner: Arc::clone(&inner),
            }),
            inner,
        }
    }

    /// Bind `listen_port` and forward new connections to `target_port`.
    ///
    /// A no-op while the server is starting, running, or restarting. Failures
    /// are reported through the sink and start the auto-restart sequence.
    /// Port 0 binds an ephemeral port; see [`ProxyServer::local_addr`].
    pub async fn start(&self, listen_port: u16, target_port: u16) {
        self.inner
            .start(listen_port, target_port, StartOrigin::Caller)
            .await;
    }

    /// Stop listening and cancel every live relay. Idempotent.
    pub fn stop(&self) {
        self.inner.cancel_pending_restart();
        if !self.inner.stop_listener() {
            debug!("Stop ignored: already stopped");
        }
    }

    /// Send future connections to `port`. Existing relays are unaffected.
    pub fn switch_target(&self, port: u16) -> Result<(), ProxyError> {
        if port == 0 {
            return Err(ProxyError::InvalidPort(port));
        }
        let previous = self.inner.target_port.swap(port, Ordering::SeqCst);
        info!(previous, port, "Switched target");
        self.inner.emit(ProxyEvent::TargetSwitched { port });
        Ok(())
    }

    /// Tear the server down for process exit.
    ///
    /// Pending restarts are abandoned and no notification is emitted after
    /// this call.
    pub fn shutdown(&self) {
        if self.inner.destroy() {
            info!("Proxy server shut down");
        }
    }

    pub fn state(&self) -> ServerState {
        lock(&self.inner.lifecycle).state
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    /// Address the listener is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.lifecycle).local_addr
    }

    /// Listen port recorded by the last start.
    pub fn listen_port(&self) -> u16 {
        lock(&self.inner.lifecycle).listen_port
    }

    pub fn target_port(&self) -> u16 {
        self.inner.target_port.load(Ordering::SeqCst)
    }

    /// Number of tracked relays.
    pub fn active_connections(&self) -> usize {
        lock(&self.inner.relays).len()
    }

    /// Snapshot of the tracked relays.
    pub fn relays(&self) -> Vec<RelayHandle> {
        lock(&self.inner.relays).values().cloned().collect()
    }

    /// Restart attempts made since the listener was last ready.
    pub fn retry_attempt(&self) -> u32 {
        lock(&self.inner.retry).attempt
    }

    /// Completed health check cycles.
    pub fn health_check_count(&self) -> u64 {
        self.inner.health_checks.load(Ordering::Relaxed)
    }

    /// Relay failures counted toward the restart threshold.
    pub fn connection_failures(&self) -> u32 {
        lock(&self.inner.failures).count
    }

    pub fn health_config(&self) -> &HealthConfig {
        &self.inner.options.health
    }
}

impl ServerInner {
    pub(super) fn is_destroyed(&self) -> bool {
        *self.destroyed.borrow()
    }

    /// Mark the server destroyed, abandon restarts and stop.
    ///
    /// Returns false if it was already destroyed.
    fn destroy(&self) -> bool {
        if self.destroyed.send_replace(true) {
            return false;
        }
        self.cancel_pending_restart();
        self.stop_listener();
        true
    }

    pub(super) fn emit(&self, event: ProxyEvent) {
        if self.is_destroyed() {
            debug!(event = event.kind(), "Event dropped after shutdown");
            return;
        }
        self.sink.emit(event);
    }

    pub(super) async fn start(
        self: &Arc<Self>,
        listen_port: u16,
        target_port: u16,
        origin: StartOrigin,
    ) {
        if self.is_destroyed() {
            debug!("Start ignored: server shut down");
            return;
        }
        if target_port == 0 {
            error!("Start rejected: target port 0");
            self.emit(ProxyEvent::FailedToStart {
                error: ProxyError::InvalidPort(target_port),
            });
            return;
        }

        let epoch = {
            let mut lifecycle = lock(&self.lifecycle);
            if matches!(
                lifecycle.state,
                ServerState::Starting | ServerState::Running
            ) {
                warn!(state = ?lifecycle.state, "Start ignored: already running");
                return;
            }

            {
                let mut retry = lock(&self.retry);
                match origin {
                    StartOrigin::Caller => {
                        if retry.restarting {
                            info!("Start ignored: restart in progress");
                            return;
                        }
                        retry.attempt = 0;
                        retry.exhausted = false;
                    }
                    StartOrigin::Restart { generation } => {
                        if retry.generation != generation {
                            debug!("Start ignored: restart superseded");
                            return;
                        }
                    }
                }
            }

            lifecycle.state = ServerState::Starting;
            lifecycle.listen_port = listen_port;
            lifecycle.epoch += 1;
            lifecycle.epoch
        };

        self.target_port.store(target_port, Ordering::SeqCst);

        let bind_addr = SocketAddr::new(self.options.bind_ip, listen_port);
        info!(bind_addr = %bind_addr, target_port, "Starting proxy server");

        match TcpListener::bind(bind_addr).await {
            Ok(listener) => self.on_listener_ready(epoch, listener),
            Err(e) => self.on_listener_failed(
                epoch,
                ProxyError::Bind {
                    port: listen_port,
                    source: Arc::new(e),
                },
            ),
        }
    }

    fn on_listener_ready(self: &Arc<Self>, epoch: u64, listener: TcpListener) {
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                return self.on_listener_failed(epoch, ProxyError::Listener(Arc::new(e)));
            }
        };

        {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.epoch != epoch || lifecycle.state != ServerState::Starting {
                debug!(local_addr = %local_addr, "Start superseded, releasing listener");
                return;
            }

            let (shutdown, shutdown_rx) = watch::channel(false);
            let accept_task = tokio::spawn(Arc::clone(self).accept_loop(
                listener,
                shutdown_rx.clone(),
                epoch,
            ));
            tokio::spawn(Arc::clone(self).health_loop(shutdown_rx, epoch));

            lifecycle.state = ServerState::Running;
            lifecycle.listen_port = local_addr.port();
            lifecycle.local_addr = Some(local_addr);
            lifecycle.run = Some(RunHandle {
                shutdown,
                accept_task,
            });
        }

        let previous_attempts = {
            let mut retry = lock(&self.retry);
            let attempts = retry.attempt;
            retry.attempt = 0;
            retry.restarting = false;
            retry.exhausted = false;
            attempts
        };

        info!(
            local_addr = %local_addr,
            target_port = self.target_port.load(Ordering::SeqCst),
            "Listener ready"
        );
        self.emit(ProxyEvent::Started {
            port: local_addr.port(),
        });

        if previous_attempts > 0 {
            info!(after_attempts = previous_attempts, "Recovered");
            self.emit(ProxyEvent::Recovered {
                after_attempts: previous_attempts,
            });
        }
    }

    fn on_listener_failed(self: &Arc<Self>, epoch: u64, error: ProxyError) {
        let run = {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.epoch != epoch {
                debug!(error = %error, "Ignoring failure of a superseded listener");
                return;
            }
            lifecycle.state = ServerState::Stopped;
            lifecycle.local_addr = None;
            lifecycle.run.take()
        };
        if let Some(run) = run {
            run.shutdown.send_replace(true);
        }

        error!(error = %error, reason = error.reason_code(), "Listener failed");
        self.emit(ProxyEvent::FailedToStart { error });
        self.schedule_restart(RestartReason::ListenerFailed);
    }

    /// Move to `Stopped`, cancelling the listener and every relay.
    ///
    /// Returns false when already stopped.
    pub(super) fn stop_listener(&self) -> bool {
        let run = {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.state == ServerState::Stopped {
                return false;
            }
            lifecycle.state = ServerState::Stopped;
            lifecycle.epoch += 1;
            lifecycle.local_addr = None;
            lifecycle.run.take()
        };
        if let Some(run) = run {
            run.shutdown.send_replace(true);
        }

        let relays: Vec<RelayHandle> = lock(&self.relays).drain().map(|(_, r)| r).collect();
        for relay in &relays {
            relay.cancel();
        }
        self.reset_failure_counter();

        info!(cancelled_relays = relays.len(), "Proxy server stopped");
        self.emit(ProxyEvent::Stopped);
        true
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
        epoch: u64,
    ) {
        let mut consecutive_errors = 0u32;

        loop {
            let accepted = tokio::select! {
                biased;
                _ = signalled(&mut shutdown) => {
                    debug!("Listener cancelled");
                    return;
                }
                result = listener.accept() => result,
            };

            match accepted {
                Ok((stream, peer)) => {
                    consecutive_errors = 0;
                    self.handle_connection(stream, peer, epoch);
                }
                Err(e) if is_connection_error(&e) => {
                    debug!(error = %e, "Connection dropped before accept completed");
                }
                Err(e) => {
                    consecutive_errors += 1;
                    error!(error = %e, consecutive_errors, "Accept error");
                    if consecutive_errors >= MAX_CONSECUTIVE_ACCEPT_ERRORS {
                        self.on_listener_failed(epoch, ProxyError::Listener(Arc::new(e)));
                        return;
                    }
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    fn handle_connection(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr, epoch: u64) {
        let target = SocketAddr::new(
            IpAddr::V4(TARGET_HOST),
            self.target_port.load(Ordering::SeqCst),
        );
        let observer: Arc<dyn RelayObserver> = Arc::new(RelayLink {
            server: Arc::downgrade(self),
        });

        // Registration and start happen under the set lock so a relay that
        // finishes immediately cannot be removed before it is inserted.
        let mut relays = lock(&self.relays);
        if lock(&self.lifecycle).epoch != epoch {
            debug!(peer = %peer, "Dropping connection accepted during stop");
            return;
        }

        let relay = Relay::new(stream, target, observer);
        relays.insert(relay.id(), relay.handle());
        let handle = relay.start();

        info!(
            relay_id = %handle.id(),
            peer = %peer,
            target = %target,
            active_connections = relays.len(),
            "Accepted connection"
        );
    }

    fn release_relay(&self, relay: &RelayHandle) {
        let mut relays = lock(&self.relays);
        if relays.remove(&relay.id()).is_some() {
            debug!(
                relay_id = %relay.id(),
                active_connections = relays.len(),
                "Connection released"
            );
        }
    }
}

/// Accept errors that concern a single connection rather than the listener.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Routes relay notifications back to the server without owning it.
struct RelayLink {
    server: Weak<ServerInner>,
}

impl RelayObserver for RelayLink {
    fn on_closed(&self, relay: &RelayHandle) {
        if let Some(server) = self.server.upgrade() {
            server.release_relay(relay);
        }
    }

    fn on_failed(&self, relay: &RelayHandle, error: ProxyError) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        server.release_relay(relay);
        server.emit(ProxyEvent::ConnectionError {
            relay_id: relay.id(),
            error,
        });
        server.record_connection_failure();
    }
}
