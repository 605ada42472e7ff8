//! Test harness for forwarder integration tests.
//!
//! Provides loopback target backends, an event collector over the server's
//! notification channel, and health settings shrunk to test timescales.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant};

use portswitch_forwarder::{ChannelSink, HealthConfig, ProxyEvent, ProxyServer, ServerOptions};

/// How a backend answers.
#[derive(Debug, Clone, Copy)]
pub enum Reply {
    /// Write every byte back.
    Echo,
    /// Answer each `PING` with `PONG`.
    PingPong,
}

#[allow(dead_code)]
pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    connections: Arc<AtomicU64>,
    bytes_received: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl TcpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        Self::spawn_with(Reply::Echo).await
    }

    pub async fn spawn_ping_pong() -> io::Result<Self> {
        Self::spawn_with(Reply::PingPong).await
    }

    pub async fn spawn_with(reply: Reply) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        Ok(Self::serve(listener, reply))
    }

    /// Bind a specific loopback port.
    pub async fn spawn_on(port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        Ok(Self::serve(listener, Reply::Echo))
    }

    fn serve(listener: TcpListener, reply: Reply) -> Self {
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicU64::new(0));
        let bytes_received = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let bytes_clone = Arc::clone(&bytes_received);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let bytes = Arc::clone(&bytes_clone);
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        let n = match stream.read(&mut buf).await {
                                            Ok(0) | Err(_) => break,
                                            Ok(n) => n,
                                        };
                                        bytes.fetch_add(n as u64, Ordering::Relaxed);
                                        let out: &[u8] = match reply {
                                            Reply::Echo => &buf[..n],
                                            Reply::PingPong if &buf[..n] == b"PING" => b"PONG",
                                            Reply::PingPong => b"ERR",
                                        };
                                        if stream.write_all(out).await.is_err() {
                                            break;
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Self {
            addr,
            connections,
            bytes_received,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Collects server notifications.
pub struct Events {
    rx: mpsc::UnboundedReceiver<ProxyEvent>,
}

#[allow(dead_code)]
impl Events {
    /// Wait for the first event matching `pred`, returning it and the events
    /// seen before it.
    pub async fn wait_for(
        &mut self,
        limit: Duration,
        pred: impl Fn(&ProxyEvent) -> bool,
    ) -> (ProxyEvent, Vec<ProxyEvent>) {
        let mut skipped = Vec::new();
        let deadline = Instant::now() + limit;
        loop {
            let event = tokio::time::timeout_at(deadline, self.rx.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out; saw {:?}", kinds(&skipped)))
                .expect("event channel closed");
            if pred(&event) {
                return (event, skipped);
            }
            skipped.push(event);
        }
    }

    /// Everything emitted within `window`.
    pub async fn collect_for(&mut self, window: Duration) -> Vec<ProxyEvent> {
        let mut events = Vec::new();
        let deadline = Instant::now() + window;
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, self.rx.recv()).await {
            events.push(event);
        }
        events
    }

    /// Events already queued.
    pub fn drain(&mut self) -> Vec<ProxyEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

pub fn kinds(events: &[ProxyEvent]) -> Vec<&'static str> {
    events.iter().map(ProxyEvent::kind).collect()
}

/// Health settings on a millisecond scale. Periodic checks are effectively
/// off unless a test shortens `check_interval`.
#[allow(dead_code)]
pub fn fast_health() -> HealthConfig {
    HealthConfig {
        check_interval: Duration::from_secs(3600),
        check_timeout: Duration::from_millis(200),
        restart_backoff_step: Duration::from_millis(50),
        restart_settle_delay: Duration::from_millis(20),
        failure_reset_after: Duration::from_secs(3600),
        ..HealthConfig::default()
    }
}

pub fn spawn_server(health: HealthConfig) -> (ProxyServer, Events) {
    let (sink, rx) = ChannelSink::new();
    let options = ServerOptions {
        health,
        ..ServerOptions::default()
    };
    (ProxyServer::with_options(options, sink), Events { rx })
}

/// A loopback port with nothing listening on it.
#[allow(dead_code)]
pub async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Poll `cond` until it holds or `limit` elapses.
#[allow(dead_code)]
pub async fn wait_until<F, Fut>(limit: Duration, mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    timeout(limit, async {
        while !cond().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

/// Write `payload` and read back the first reply.
#[allow(dead_code)]
pub async fn roundtrip(stream: &mut TcpStream, payload: &[u8]) -> io::Result<Vec<u8>> {
    stream.write_all(payload).await?;
    let mut buf = vec![0u8; 64];
    let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))??;
    buf.truncate(n);
    Ok(buf)
}
