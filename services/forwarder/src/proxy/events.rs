//! Lifecycle notifications.
//!
//! The server reports every lifecycle transition through an [`EventSink`].
//! Sinks are called from whichever task observed the transition and must not
//! block or call back into the server.

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::error::ProxyError;
use super::relay::RelayId;

/// A lifecycle notification.
#[derive(Debug, Clone)]
pub enum ProxyEvent {
    /// The listener is ready on `port`.
    Started { port: u16 },
    /// The server entered the stopped state.
    Stopped,
    /// Binding failed, the listener failed, or the retry budget ran out.
    FailedToStart { error: ProxyError },
    /// New connections now go to `port`.
    TargetSwitched { port: u16 },
    /// A relay terminated with an error.
    ConnectionError { relay_id: RelayId, error: ProxyError },
    /// The listener became ready after one or more restart attempts.
    Recovered { after_attempts: u32 },
    /// A restart attempt has been scheduled.
    WillRestart { attempt: u32, max_attempts: u32 },
}

impl ProxyEvent {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyEvent::Started { .. } => "started",
            ProxyEvent::Stopped => "stopped",
            ProxyEvent::FailedToStart { .. } => "failed_to_start",
            ProxyEvent::TargetSwitched { .. } => "target_switched",
            ProxyEvent::ConnectionError { .. } => "connection_error",
            ProxyEvent::Recovered { .. } => "recovered",
            ProxyEvent::WillRestart { .. } => "will_restart",
        }
    }
}

/// Consumer of lifecycle notifications.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: ProxyEvent);
}

/// Forwards events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProxyEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver that drains it.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProxyEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: ProxyEvent) {
        // Receiver gone means nobody is listening anymore.
        let _ = self.tx.send(event);
    }
}

/// Writes events to the tracing subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: ProxyEvent) {
        match &event {
            ProxyEvent::Started { port } => info!(port, "Proxy server started"),
            ProxyEvent::Stopped => info!("Proxy server stopped"),
            ProxyEvent::FailedToStart { error } => error!(
                error = %error,
                reason = error.reason_code(),
                "Proxy server failed to start"
            ),
            ProxyEvent::TargetSwitched { port } => info!(port, "Proxy target switched"),
            ProxyEvent::ConnectionError { relay_id, error } => warn!(
                relay_id = %relay_id,
                error = %error,
                "Proxy connection error"
            ),
            ProxyEvent::Recovered { after_attempts } => {
                info!(after_attempts, "Proxy server recovered")
            }
            ProxyEvent::WillRestart {
                attempt,
                max_attempts,
            } => warn!(attempt, max_attempts, "Proxy server restarting"),
        }
    }
}

/// Fans one event out to several sinks.
pub struct Tee(pub Vec<Box<dyn EventSink>>);

impl EventSink for Tee {
    fn emit(&self, event: ProxyEvent) {
        for sink in &self.0 {
            sink.emit(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_delivers_in_order() {
        let (sink, mut rx) = ChannelSink::new();
        sink.emit(ProxyEvent::Started { port: 8080 });
        sink.emit(ProxyEvent::TargetSwitched { port: 3001 });
        sink.emit(ProxyEvent::Stopped);

        assert!(matches!(rx.recv().await, Some(ProxyEvent::Started { port: 8080 })));
        assert!(matches!(
            rx.recv().await,
            Some(ProxyEvent::TargetSwitched { port: 3001 })
        ));
        assert_eq!(rx.recv().await.map(|e| e.kind()), Some("stopped"));
    }

    #[test]
    fn test_channel_sink_ignores_closed_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.emit(ProxyEvent::Stopped);
    }

    #[tokio::test]
    async fn test_tee_clones_to_every_sink() {
        let (a, mut rx_a) = ChannelSink::new();
        let (b, mut rx_b) = ChannelSink::new();
        let tee = Tee(vec![Box::new(a), Box::new(b), Box::new(LogSink)]);

        tee.emit(ProxyEvent::Recovered { after_attempts: 2 });

        assert!(matches!(
            rx_a.recv().await,
            Some(ProxyEvent::Recovered { after_attempts: 2 })
        ));
        assert!(matches!(
            rx_b.recv().await,
            Some(ProxyEvent::Recovered { after_attempts: 2 })
        ));
    }
}
