//! Connection state machine
//!
//! ```text
//! DISCONNECTED ──connect──▶ CONNECTING ──setup ok──▶ CONNECTED
//!       ▲                      │                        │
//!       └──── failed/cancel ───┘      heartbeat misses  │
//!       └───────────────────────────── > max / logout ──┘
//! ```
//!
//! The initial connect retries `setup` with a fixed delay between attempts
//! and races the whole loop against a [`CancellationToken`]. Once connected,
//! a monitor task heartbeats at a fixed interval; more than
//! `max_heartbeat_retries` consecutive misses force a logout.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::controller::VolumeController;
use crate::error::{Error, NetworkError, Result};
use crate::protocol::ServerAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Connected on the given attempt (1-based)
    Connected { attempts: u32 },
    /// The cancel token fired first
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected(ServerAddress),
    /// The server stopped answering heartbeats; the UI should return to its
    /// entry screen
    ForcedLogout,
    LoggedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    /// Consecutive misses so far
    Retrying(u32),
    Logout,
}

/// Counts consecutive heartbeat misses
#[derive(Debug, Clone)]
pub struct HeartbeatCounter {
    misses: u32,
    max_retries: u32,
}

impl HeartbeatCounter {
    pub fn new(max_retries: u32) -> Self {
        Self {
            misses: 0,
            max_retries,
        }
    }

    /// Any success resets the count; exceeding the maximum means logout
    pub fn record(&mut self, alive: bool) -> Verdict {
        if alive {
            self.misses = 0;
            return Verdict::Healthy;
        }
        self.misses += 1;
        if self.misses > self.max_retries {
            Verdict::Logout
        } else {
            Verdict::Retrying(self.misses)
        }
    }

    pub fn misses(&self) -> u32 {
        self.misses
    }
}

struct Monitor {
    cancel: CancellationToken,
    _task: JoinHandle<()>,
}

pub struct Session {
    controller: Arc<dyn VolumeController>,
    config: SessionConfig,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
    monitor: Mutex<Option<Monitor>>,
    address: Mutex<Option<ServerAddress>>,
}

impl Session {
    pub fn new(controller: Arc<dyn VolumeController>, config: SessionConfig) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            controller,
            config,
            state,
            events,
            monitor: Mutex::new(None),
            address: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Address of the current (or last) successful connection
    pub fn address(&self) -> Option<ServerAddress> {
        self.address.lock().clone()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!("Session {:?} -> {:?}", previous, state);
        }
    }

    fn emit(&self, event: SessionEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    /// Connect with retries. Cancelling `cancel` stops the loop promptly and
    /// resolves to [`ConnectOutcome::Cancelled`].
    pub async fn connect(
        self: &Arc<Self>,
        address: &ServerAddress,
        cancel: &CancellationToken,
    ) -> Result<ConnectOutcome> {
        self.stop_heartbeat();
        self.set_state(ConnectionState::Connecting);
        tracing::info!("Connecting to {}", address);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.retry(address) => Some(result),
        };

        match outcome {
            None => {
                tracing::info!("Connection to {} cancelled", address);
                // an attempt may have been half way through
                self.controller.close().await;
                self.set_state(ConnectionState::Disconnected);
                Ok(ConnectOutcome::Cancelled)
            }
            Some(Ok(attempts)) => {
                *self.address.lock() = Some(address.clone());
                self.set_state(ConnectionState::Connected);
                self.emit(SessionEvent::Connected(address.clone()));
                self.start_heartbeat();
                Ok(ConnectOutcome::Connected { attempts })
            }
            Some(Err(e)) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn retry(&self, address: &ServerAddress) -> Result<u32> {
        let attempts = self.config.connect_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.config.retry_delay()).await;
            }
            match self.controller.setup(address).await {
                Ok(()) => return Ok(attempt),
                Err(e) => {
                    tracing::warn!("Connection attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::Network(NetworkError::ConnectionFailed(address.to_string()))
        }))
    }

    fn start_heartbeat(self: &Arc<Self>) {
        self.stop_heartbeat();

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let session = Arc::downgrade(self);
        let controller = self.controller.clone();
        let interval = self.config.heartbeat_interval();
        let max_retries = self.config.max_heartbeat_retries;
        let mut counter = HeartbeatCounter::new(max_retries);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let alive = tokio::select! {
                    _ = token.cancelled() => return,
                    alive = controller.heartbeat() => alive,
                };

                match counter.record(alive) {
                    Verdict::Healthy => {}
                    Verdict::Retrying(misses) => {
                        tracing::warn!("Heartbeat missed ({}/{})", misses, max_retries);
                    }
                    Verdict::Logout => {
                        tracing::error!(
                            "Server unresponsive after {} heartbeats, logging out",
                            counter.misses()
                        );
                        if let Some(session) = session.upgrade() {
                            session.forced_logout().await;
                        }
                        return;
                    }
                }
            }
        });

        *self.monitor.lock() = Some(Monitor {
            cancel,
            _task: task,
        });
    }

    fn stop_heartbeat(&self) {
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.cancel.cancel();
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().is_some()
    }

    async fn forced_logout(&self) {
        // runs on the monitor task itself, which ends right after
        self.monitor.lock().take();
        self.controller.close().await;
        self.set_state(ConnectionState::Disconnected);
        self.emit(SessionEvent::ForcedLogout);
    }

    /// User-initiated disconnect
    pub async fn logout(&self) {
        self.stop_heartbeat();
        self.controller.close().await;
        self.set_state(ConnectionState::Disconnected);
        self.emit(SessionEvent::LoggedOut);
        tracing::info!("Logged out");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.get_mut().take() {
            monitor.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::RecordingController;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::time::Instant;

    fn address() -> ServerAddress {
        ServerAddress::new("127.0.0.1", 9002).unwrap()
    }

    fn session() -> (Arc<Session>, Arc<RecordingController>) {
        let controller = RecordingController::new();
        let session = Session::new(controller.clone(), SessionConfig::default());
        (session, controller)
    }

    fn count(controller: &RecordingController, call: &str) -> usize {
        controller.calls().iter().filter(|c| c.as_str() == call).count()
    }

    #[test]
    fn test_counter_logs_out_on_fourth_miss() {
        let mut counter = HeartbeatCounter::new(3);
        assert_eq!(counter.record(false), Verdict::Retrying(1));
        assert_eq!(counter.record(false), Verdict::Retrying(2));
        assert_eq!(counter.record(false), Verdict::Retrying(3));
        assert_eq!(counter.record(false), Verdict::Logout);
    }

    #[test]
    fn test_counter_resets_on_success() {
        let mut counter = HeartbeatCounter::new(3);
        for _ in 0..3 {
            counter.record(false);
        }
        assert_eq!(counter.record(true), Verdict::Healthy);
        assert_eq!(counter.misses(), 0);
        for _ in 0..3 {
            assert_ne!(counter.record(false), Verdict::Logout);
        }
        assert_eq!(counter.record(false), Verdict::Logout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_first_try() {
        let (session, _controller) = session();
        let mut events = session.events();

        let outcome = session.connect(&address(), &CancellationToken::new()).await;
        assert_eq!(outcome.unwrap(), ConnectOutcome::Connected { attempts: 1 });
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(session.address(), Some(address()));
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Connected(address()));
        assert!(session.is_monitoring());
        session.logout().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_with_delay() {
        let (session, controller) = session();
        controller.setup_failures.store(2, Ordering::SeqCst);

        let started = Instant::now();
        let outcome = session.connect(&address(), &CancellationToken::new()).await;
        assert_eq!(outcome.unwrap(), ConnectOutcome::Connected { attempts: 3 });
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_millis(2100));
        session.logout().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up_after_five_attempts() {
        let (session, controller) = session();
        controller.setup_failures.store(usize::MAX, Ordering::SeqCst);

        let started = Instant::now();
        let outcome = session.connect(&address(), &CancellationToken::new()).await;
        assert!(outcome.is_err());
        assert_eq!(controller.setups.load(Ordering::SeqCst), 5);
        assert!(started.elapsed() >= Duration::from_secs(4));
        assert!(started.elapsed() < Duration::from_millis(4100));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!session.is_monitoring());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_retry_loop_promptly() {
        let (session, controller) = session();
        controller.setup_failures.store(usize::MAX, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let outcome = session.connect(&address(), &cancel).await.unwrap();
        assert_eq!(outcome, ConnectOutcome::Cancelled);
        assert!(started.elapsed() >= Duration::from_millis(1500));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(session.state(), ConnectionState::Disconnected);

        // no further attempts after cancellation
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(controller.setups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pre_cancelled_token_never_connects() {
        let (session, controller) = session();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = session.connect(&address(), &cancel).await.unwrap();
        assert_eq!(outcome, ConnectOutcome::Cancelled);
        assert_eq!(controller.setups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_logout_exactly_once_on_fourth_miss() {
        let (session, controller) = session();
        let mut events = session.events();
        session.connect(&address(), &CancellationToken::new()).await.unwrap();
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Connected(address()));

        controller.heartbeat_ok.store(false, Ordering::SeqCst);

        // three misses are tolerated
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(count(&controller, "heartbeat"), 3);
        assert_eq!(session.state(), ConnectionState::Connected);
        assert!(events.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count(&controller, "heartbeat"), 4);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(events.try_recv().unwrap(), SessionEvent::ForcedLogout);
        assert_eq!(controller.closes.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count(&controller, "heartbeat"), 4);
        assert!(events.try_recv().is_err());
        assert!(!session.is_monitoring());
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_heartbeats_keep_session() {
        let (session, controller) = session();
        session.connect(&address(), &CancellationToken::new()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(count(&controller, "heartbeat"), 10);
        assert_eq!(session.state(), ConnectionState::Connected);

        session.logout().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count(&controller, "heartbeat"), 10);
    }
}
