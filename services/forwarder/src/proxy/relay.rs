//! A single proxied connection.
//!
//! A relay owns the accepted client socket and the outbound socket to the
//! target captured when the relay was created. Each direction is pumped by
//! its own task. End-of-stream on either leg completes the whole relay, and
//! any read, write or connect error fails it.
//!
//! Whatever combination of events races to end a relay, the owner receives
//! exactly one of [`RelayObserver::on_closed`] / [`RelayObserver::on_failed`],
//! guarded by an atomic latch.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};
use ulid::Ulid;

use super::error::ProxyError;
use super::signalled;

/// Largest chunk read from a socket in one call.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Opaque unique relay identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelayId(Ulid);

impl RelayId {
    pub const PREFIX: &'static str = "relay";

    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RelayId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RelayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", Self::PREFIX, self.0)
    }
}

/// Terminal outcome of a relay.
#[derive(Debug, Clone)]
pub enum RelayOutcome {
    /// End-of-stream on either leg, or cancellation.
    Closed,
    /// Transport failure on either leg.
    Failed(ProxyError),
}

impl RelayOutcome {
    /// The error describing this outcome. A clean close is
    /// [`ProxyError::ConnectionClosed`].
    pub fn error(&self) -> ProxyError {
        match self {
            RelayOutcome::Closed => ProxyError::ConnectionClosed,
            RelayOutcome::Failed(error) => error.clone(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, RelayOutcome::Failed(_))
    }
}

/// Receives the single terminal notification of each relay.
pub trait RelayObserver: Send + Sync + 'static {
    fn on_closed(&self, relay: &RelayHandle);
    fn on_failed(&self, relay: &RelayHandle, error: ProxyError);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ClientToTarget,
    TargetToClient,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::ClientToTarget => "client_to_target",
            Direction::TargetToClient => "target_to_client",
        }
    }
}

struct RelayShared {
    id: RelayId,
    target: SocketAddr,
    peer: Option<SocketAddr>,
    cancelled: AtomicBool,
    cancel_tx: watch::Sender<bool>,
    reported: AtomicBool,
    observer: Arc<dyn RelayObserver>,
    bytes_to_target: AtomicU64,
    bytes_to_client: AtomicU64,
}

/// Cloneable handle to a relay, used by the owner to track and cancel it.
#[derive(Clone)]
pub struct RelayHandle {
    shared: Arc<RelayShared>,
}

impl fmt::Debug for RelayHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayHandle")
            .field("id", &self.shared.id)
            .field("target", &self.shared.target)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl RelayHandle {
    pub fn id(&self) -> RelayId {
        self.shared.id
    }

    /// Target captured when the relay was created.
    pub fn target(&self) -> SocketAddr {
        self.shared.target
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.shared.peer
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Whether the terminal notification has been delivered.
    pub fn is_finished(&self) -> bool {
        self.shared.reported.load(Ordering::Acquire)
    }

    pub fn bytes_to_target(&self) -> u64 {
        self.shared.bytes_to_target.load(Ordering::Relaxed)
    }

    pub fn bytes_to_client(&self) -> u64 {
        self.shared.bytes_to_client.load(Ordering::Relaxed)
    }

    /// Tear down both sockets. Safe to call any number of times from any task.
    pub fn cancel(&self) {
        self.shared.cancel();
    }
}

impl RelayShared {
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel_tx.send_replace(true);
        debug!(relay_id = %self.id, "Relay cancelled");
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Map an I/O error to an outcome. Errors raised while tearing down are
    /// treated as a close, not a failure.
    fn failure(&self, err: std::io::Error) -> RelayOutcome {
        if self.is_cancelled() {
            RelayOutcome::Closed
        } else {
            RelayOutcome::Failed(ProxyError::transport(err))
        }
    }

    fn record(&self, direction: Direction, n: usize) {
        let counter = match direction {
            Direction::ClientToTarget => &self.bytes_to_target,
            Direction::TargetToClient => &self.bytes_to_client,
        };
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn finish(self: &Arc<Self>, outcome: RelayOutcome) {
        if self.reported.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel();

        let handle = RelayHandle {
            shared: Arc::clone(self),
        };
        let bytes_to_target = self.bytes_to_target.load(Ordering::Relaxed);
        let bytes_to_client = self.bytes_to_client.load(Ordering::Relaxed);
        let reason = outcome.error().reason_code();

        match outcome {
            RelayOutcome::Closed => {
                debug!(
                    relay_id = %self.id,
                    reason,
                    bytes_to_target,
                    bytes_to_client,
                    "Relay closed"
                );
                self.observer.on_closed(&handle);
            }
            RelayOutcome::Failed(error) => {
                info!(
                    relay_id = %self.id,
                    error = %error,
                    reason,
                    bytes_to_target,
                    bytes_to_client,
                    "Relay failed"
                );
                self.observer.on_failed(&handle, error);
            }
        }
    }
}

/// A relay that has been created but not started.
pub struct Relay {
    shared: Arc<RelayShared>,
    client: TcpStream,
}

impl Relay {
    /// Create a relay for an accepted client socket.
    ///
    /// `target` is fixed for the lifetime of the relay.
    pub fn new(client: TcpStream, target: SocketAddr, observer: Arc<dyn RelayObserver>) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        let shared = Arc::new(RelayShared {
            id: RelayId::new(),
            target,
            peer: client.peer_addr().ok(),
            cancelled: AtomicBool::new(false),
            cancel_tx,
            reported: AtomicBool::new(false),
            observer,
            bytes_to_target: AtomicU64::new(0),
            bytes_to_client: AtomicU64::new(0),
        });
        Self { shared, client }
    }

    pub fn id(&self) -> RelayId {
        self.shared.id
    }

    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Connect to the target and begin forwarding in both directions.
    pub fn start(self) -> RelayHandle {
        let handle = self.handle();
        let span = tracing::info_span!(
            "relay",
            id = %self.shared.id,
            target = %self.shared.target,
            peer = ?self.shared.peer,
        );
        tokio::spawn(run(self.shared, self.client).instrument(span));
        handle
    }
}

async fn run(shared: Arc<RelayShared>, client: TcpStream) {
    let mut cancel_rx = shared.cancel_tx.subscribe();

    let connect = tokio::select! {
        biased;
        _ = signalled(&mut cancel_rx) => {
            shared.finish(RelayOutcome::Closed);
            return;
        }
        result = TcpStream::connect(shared.target) => result,
    };

    let server = match connect {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "Target connection failed");
            let outcome = shared.failure(e);
            shared.finish(outcome);
            return;
        }
    };
    debug!("Target connection ready");

    let _ = client.set_nodelay(true);
    let _ = server.set_nodelay(true);

    let (client_read, client_write) = client.into_split();
    let (server_read, server_write) = server.into_split();

    tokio::spawn(
        pump(
            Arc::clone(&shared),
            client_read,
            server_write,
            Direction::ClientToTarget,
        )
        .in_current_span(),
    );
    tokio::spawn(
        pump(
            Arc::clone(&shared),
            server_read,
            client_write,
            Direction::TargetToClient,
        )
        .in_current_span(),
    );
}

async fn pump(
    shared: Arc<RelayShared>,
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    direction: Direction,
) {
    let mut cancel_rx = shared.cancel_tx.subscribe();
    let mut buf = vec![0u8; CHUNK_SIZE];

    let outcome = loop {
        let read = tokio::select! {
            biased;
            _ = signalled(&mut cancel_rx) => break RelayOutcome::Closed,
            result = reader.read(&mut buf) => result,
        };

        let n = match read {
            Ok(0) => {
                debug!(direction = direction.label(), "End of stream");
                break RelayOutcome::Closed;
            }
            Ok(n) => n,
            Err(e) => break shared.failure(e),
        };

        let write = tokio::select! {
            biased;
            _ = signalled(&mut cancel_rx) => break RelayOutcome::Closed,
            result = writer.write_all(&buf[..n]) => result,
        };

        if let Err(e) = write {
            break shared.failure(e);
        }
        shared.record(direction, n);
    };

    shared.finish(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Recorder {
        closed: Mutex<Vec<RelayId>>,
        failed: Mutex<Vec<(RelayId, String)>>,
    }

    impl Recorder {
        fn total(&self) -> usize {
            self.closed.lock().unwrap().len() + self.failed.lock().unwrap().len()
        }
    }

    impl RelayObserver for Recorder {
        fn on_closed(&self, relay: &RelayHandle) {
            self.closed.lock().unwrap().push(relay.id());
        }

        fn on_failed(&self, relay: &RelayHandle, error: ProxyError) {
            self.failed
                .lock()
                .unwrap()
                .push((relay.id(), error.reason_code().to_string()));
        }
    }

    async fn echo_target() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    /// Returns (client side, relay-owned accepted side).
    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    async fn wait_for_total(recorder: &Recorder, expected: usize) {
        for _ in 0..100 {
            if recorder.total() >= expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_relay_id_display() {
        let id = RelayId::new();
        assert!(id.to_string().starts_with("relay_"));
        assert_ne!(id, RelayId::new());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_forwards_bytes_in_order() {
        let target = echo_target().await;
        let recorder = Arc::new(Recorder::default());
        let (mut client, accepted) = socket_pair().await;

        let handle = Relay::new(accepted, target, recorder.clone()).start();

        let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
        let (mut read_half, mut write_half) = client.split();
        let send = async {
            write_half.write_all(&payload).await.unwrap();
        };
        let recv = async {
            let mut received = vec![0u8; payload.len()];
            read_half.read_exact(&mut received).await.unwrap();
            received
        };
        let ((), received) = tokio::join!(send, recv);
        assert_eq!(received, payload);

        drop(client);
        wait_for_total(&recorder, 1).await;

        assert_eq!(recorder.closed.lock().unwrap().as_slice(), &[handle.id()]);
        assert!(recorder.failed.lock().unwrap().is_empty());
        assert_eq!(handle.bytes_to_target(), payload.len() as u64);
        assert_eq!(handle.bytes_to_client(), payload.len() as u64);
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn test_unreachable_target_fails_once() {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let recorder = Arc::new(Recorder::default());
        let (_client, accepted) = socket_pair().await;
        let handle = Relay::new(accepted, dead_addr, recorder.clone()).start();

        wait_for_total(&recorder, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let failed = recorder.failed.lock().unwrap().clone();
        assert_eq!(failed, vec![(handle.id(), "transport_error".to_string())]);
        assert!(recorder.closed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_reports_closed() {
        let target = echo_target().await;
        let recorder = Arc::new(Recorder::default());
        let (mut client, accepted) = socket_pair().await;
        let handle = Relay::new(accepted, target, recorder.clone()).start();

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();

        handle.cancel();
        handle.cancel();
        handle.clone().cancel();

        wait_for_total(&recorder, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.total(), 1);
        assert_eq!(recorder.closed.lock().unwrap().len(), 1);

        // The client leg is torn down.
        let n = tokio::time::timeout(Duration::from_secs(1), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_terminations_notify_once() {
        for _ in 0..20 {
            // Target closes as soon as it accepts.
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let target = listener.local_addr().unwrap();
            tokio::spawn(async move {
                if let Ok((stream, _)) = listener.accept().await {
                    drop(stream);
                }
            });

            let recorder = Arc::new(Recorder::default());
            let (client, accepted) = socket_pair().await;
            let handle = Relay::new(accepted, target, recorder.clone()).start();

            let canceller = handle.clone();
            let cancel_task = tokio::spawn(async move { canceller.cancel() });
            drop(client);
            handle.cancel();
            cancel_task.await.unwrap();

            wait_for_total(&recorder, 1).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(recorder.total(), 1);
        }
    }

    #[test]
    fn test_outcome_error_maps_close() {
        assert_eq!(RelayOutcome::Closed.error().reason_code(), "connection_closed");
        assert!(!RelayOutcome::Closed.is_failure());

        let failed = RelayOutcome::Failed(ProxyError::transport(std::io::Error::from(
            std::io::ErrorKind::ConnectionReset,
        )));
        assert_eq!(failed.error().reason_code(), "transport_error");
        assert!(failed.is_failure());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_target_reset_mid_stream_fails_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        let (reset_tx, reset_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            let _ = reset_rx.await;
            // Zero linger turns the close into a reset.
            #[allow(deprecated)]
            stream.set_linger(Some(Duration::ZERO)).unwrap();
            drop(stream);
        });

        let recorder = Arc::new(Recorder::default());
        let (mut client, accepted) = socket_pair().await;
        let handle = Relay::new(accepted, target, recorder.clone()).start();

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        reset_tx.send(()).unwrap();

        wait_for_total(&recorder, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let failed = recorder.failed.lock().unwrap().clone();
        assert_eq!(failed, vec![(handle.id(), "transport_error".to_string())]);
        assert!(recorder.closed.lock().unwrap().is_empty());
        assert!(handle.is_finished());
    }
}
