//! Health supervision and auto restart.
//!
//! While the server is running, a periodic check verifies that the listener
//! is still accepting and that `127.0.0.1:<target port>` accepts a throwaway
//! connection. Relay failures are counted; the counter resets once no
//! failure has been seen for `failure_reset_after`.
//!
//! Any unhealthy signal schedules a restart: wait `attempt * 2s`, stop, wait
//! the settle delay, start again with the recorded ports. Overlapping
//! triggers collapse into the restart already in flight. After
//! `max_retry_attempts` consecutive attempts the supervisor gives up and
//! reports [`ProxyError::ServerUnavailable`] once.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::error::ProxyError;
use super::events::ProxyEvent;
use super::server::{lock, ServerInner, ServerState, StartOrigin, TARGET_HOST};
use super::signalled;

/// Default interval between health checks.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Default restart budget per run.
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;

/// Default number of relay failures that marks the server unhealthy.
pub const DEFAULT_MAX_CONNECTION_FAILURES: u32 = 5;

/// Default probe connect timeout.
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Restart delay grows linearly by this step per attempt.
pub const DEFAULT_RESTART_BACKOFF_STEP: Duration = Duration::from_secs(2);

/// Pause between stop and start during a restart.
pub const DEFAULT_RESTART_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Quiet period after which the relay failure counter resets.
pub const DEFAULT_FAILURE_RESET_AFTER: Duration = Duration::from_secs(60);

/// Health supervision settings, fixed per server instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthConfig {
    /// Interval between periodic checks.
    pub check_interval: Duration,
    /// Restart attempts before giving up.
    pub max_retry_attempts: u32,
    /// Relay failures that trigger a restart.
    pub max_connection_failures: u32,
    /// Probe connect timeout.
    pub check_timeout: Duration,
    /// Linear backoff step between restart attempts.
    pub restart_backoff_step: Duration,
    /// Pause between stop and start during a restart.
    pub restart_settle_delay: Duration,
    /// Quiet period after which the failure counter resets.
    pub failure_reset_after: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            max_connection_failures: DEFAULT_MAX_CONNECTION_FAILURES,
            check_timeout: DEFAULT_CHECK_TIMEOUT,
            restart_backoff_step: DEFAULT_RESTART_BACKOFF_STEP,
            restart_settle_delay: DEFAULT_RESTART_SETTLE_DELAY,
            failure_reset_after: DEFAULT_FAILURE_RESET_AFTER,
        }
    }
}

impl HealthConfig {
    /// Delay before restart attempt `attempt` (1-based): 2s, 4s, 6s, ...
    pub fn restart_delay(&self, attempt: u32) -> Duration {
        self.restart_backoff_step * attempt
    }
}

/// Why a restart was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartReason {
    /// Bind failed or the listener failed while running.
    ListenerFailed,
    /// The periodic check found the listener no longer accepting.
    ListenerNotReady,
    /// The health probe could not connect to the target.
    TargetUnreachable { port: u16 },
    /// Relay failures reached the threshold.
    TooManyConnectionFailures { count: u32 },
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartReason::ListenerFailed => write!(f, "listener failed"),
            RestartReason::ListenerNotReady => write!(f, "listener not ready"),
            RestartReason::TargetUnreachable { port } => {
                write!(f, "target 127.0.0.1:{port} unreachable")
            }
            RestartReason::TooManyConnectionFailures { count } => {
                write!(f, "{count} connection failures")
            }
        }
    }
}

/// Result of one periodic check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy(RestartReason),
}

/// Attempt a throwaway connection to `127.0.0.1:port`.
///
/// The probe socket is dropped before returning on every path.
pub async fn probe_target(port: u16, probe_timeout: Duration) -> Result<(), ProxyError> {
    let addr = SocketAddr::new(IpAddr::V4(TARGET_HOST), port);
    match timeout(probe_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            drop(stream);
            Ok(())
        }
        Ok(Err(e)) => Err(ProxyError::TargetUnreachable {
            port,
            reason: e.to_string(),
        }),
        Err(_) => Err(ProxyError::TargetUnreachable {
            port,
            reason: format!("connect timed out after {probe_timeout:?}"),
        }),
    }
}

/// Outcome of asking for a restart.
enum RestartDecision {
    InProgress,
    Exhausted { attempts: u32 },
    AlreadyExhausted,
    Scheduled {
        attempt: u32,
        generation: u64,
        cancel: watch::Receiver<bool>,
    },
}

impl ServerInner {
    /// Periodic check loop for one listener run.
    pub(super) async fn health_loop(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        epoch: u64,
    ) {
        let period = self.options.health.check_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = signalled(&mut shutdown) => {
                    debug!("Health checks stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let cycle = self.health_checks.fetch_add(1, Ordering::Relaxed) + 1;

            let status = tokio::select! {
                biased;
                _ = signalled(&mut shutdown) => return,
                status = self.check_health(epoch) => status,
            };

            match status {
                HealthStatus::Healthy => debug!(cycle, "Health check passed"),
                HealthStatus::Unhealthy(reason) => {
                    warn!(cycle, reason = %reason, "Health check failed");
                    self.schedule_restart(reason);
                }
            }
        }
    }

    /// Run one health check against the listener and the current target.
    pub(super) async fn check_health(&self, epoch: u64) -> HealthStatus {
        if !self.is_accepting(epoch) {
            return HealthStatus::Unhealthy(RestartReason::ListenerNotReady);
        }

        let port = self.target_port.load(Ordering::SeqCst);
        match probe_target(port, self.options.health.check_timeout).await {
            Ok(()) => HealthStatus::Healthy,
            Err(e) => {
                debug!(error = %e, "Target probe failed");
                HealthStatus::Unhealthy(RestartReason::TargetUnreachable { port })
            }
        }
    }

    fn is_accepting(&self, epoch: u64) -> bool {
        let lifecycle = lock(&self.lifecycle);
        lifecycle.epoch == epoch
            && lifecycle.state == ServerState::Running
            && lifecycle
                .run
                .as_ref()
                .is_some_and(|run| !run.accept_task.is_finished())
    }

    /// Count a relay failure and restart once the threshold is reached.
    pub(super) fn record_connection_failure(self: &Arc<Self>) {
        let max_failures = self.options.health.max_connection_failures.max(1);

        let tripped = {
            let mut failures = lock(&self.failures);
            failures.count += 1;
            failures.generation += 1;
            if let Some(timer) = failures.reset_timer.take() {
                timer.abort();
            }

            if failures.count >= max_failures {
                let count = failures.count;
                failures.count = 0;
                Some(count)
            } else {
                let generation = failures.generation;
                let reset_after = self.options.health.failure_reset_after;
                let server = Arc::downgrade(self);
                failures.reset_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(reset_after).await;
                    if let Some(server) = server.upgrade() {
                        let mut failures = lock(&server.failures);
                        if failures.generation == generation {
                            debug!(count = failures.count, "Connection failure counter reset");
                            failures.count = 0;
                            failures.reset_timer = None;
                        }
                    }
                }));
                None
            }
        };

        if let Some(count) = tripped {
            warn!(count, max_failures, "Too many connection failures");
            self.schedule_restart(RestartReason::TooManyConnectionFailures { count });
        }
    }

    /// Zero the failure counter and cancel its reset timer.
    pub(super) fn reset_failure_counter(&self) {
        let mut failures = lock(&self.failures);
        failures.count = 0;
        failures.generation += 1;
        if let Some(timer) = failures.reset_timer.take() {
            timer.abort();
        }
    }

    /// Request an automatic restart.
    pub(super) fn schedule_restart(self: &Arc<Self>, reason: RestartReason) {
        if self.is_destroyed() {
            return;
        }

        let max_attempts = self.options.health.max_retry_attempts;
        let decision = {
            let mut retry = lock(&self.retry);
            if retry.restarting {
                RestartDecision::InProgress
            } else if retry.attempt >= max_attempts {
                if retry.exhausted {
                    RestartDecision::AlreadyExhausted
                } else {
                    retry.exhausted = true;
                    RestartDecision::Exhausted {
                        attempts: retry.attempt,
                    }
                }
            } else {
                retry.attempt += 1;
                retry.restarting = true;
                let (cancel_tx, cancel_rx) = watch::channel(false);
                retry.cancel = Some(cancel_tx);
                RestartDecision::Scheduled {
                    attempt: retry.attempt,
                    generation: retry.generation,
                    cancel: cancel_rx,
                }
            }
        };

        match decision {
            RestartDecision::InProgress => {
                debug!(reason = %reason, "Restart already in progress");
            }
            RestartDecision::AlreadyExhausted => {
                debug!(reason = %reason, "Restart budget already exhausted");
            }
            RestartDecision::Exhausted { attempts } => {
                error!(
                    attempts,
                    reason = %reason,
                    "Giving up on automatic restart"
                );
                self.emit(ProxyEvent::FailedToStart {
                    error: ProxyError::ServerUnavailable { attempts },
                });
            }
            RestartDecision::Scheduled {
                attempt,
                generation,
                cancel,
            } => {
                let delay = self.options.health.restart_delay(attempt);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "Scheduling restart"
                );
                self.emit(ProxyEvent::WillRestart {
                    attempt,
                    max_attempts,
                });
                tokio::spawn(Arc::clone(self).run_restart(attempt, generation, cancel));
            }
        }
    }

    /// Abandon any restart that has not yet called start.
    pub(super) fn cancel_pending_restart(&self) {
        let mut retry = lock(&self.retry);
        retry.generation += 1;
        retry.restarting = false;
        if let Some(cancel) = retry.cancel.take() {
            cancel.send_replace(true);
        }
    }

    async fn run_restart(
        self: Arc<Self>,
        attempt: u32,
        generation: u64,
        mut cancel: watch::Receiver<bool>,
    ) {
        let mut destroyed = self.destroyed.subscribe();
        let health = self.options.health.clone();

        if !pause(health.restart_delay(attempt), &mut cancel, &mut destroyed).await {
            debug!(attempt, "Restart abandoned");
            return;
        }

        let listen_port = lock(&self.lifecycle).listen_port;
        let target_port = self.target_port.load(Ordering::SeqCst);
        info!(attempt, listen_port, target_port, "Restarting proxy server");

        self.stop_listener();
        {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.state == ServerState::Stopped {
                lifecycle.state = ServerState::Restarting;
            }
        }

        if !pause(health.restart_settle_delay, &mut cancel, &mut destroyed).await {
            debug!(attempt, "Restart abandoned after stop");
            return;
        }

        {
            let mut retry = lock(&self.retry);
            if retry.generation != generation {
                return;
            }
            // Released before start so a failed start can schedule the next attempt.
            retry.restarting = false;
            retry.cancel = None;
        }

        self.start(listen_port, target_port, StartOrigin::Restart { generation })
            .await;
    }
}

/// Sleep for `delay` unless the restart is cancelled or the server destroyed.
async fn pause(
    delay: Duration,
    cancel: &mut watch::Receiver<bool>,
    destroyed: &mut watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        biased;
        _ = signalled(cancel) => false,
        _ = signalled(destroyed) => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
