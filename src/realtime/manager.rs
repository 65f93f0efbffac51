//! Session manager: keeps the realtime session connected while active.
//!
//! A monitor task watches the session's state channel. When the connection
//! drops (or errors) while the manager is active it runs a bounded retry
//! loop; once the attempts are exhausted the session is left in a terminal
//! error state until [`SessionManager::start`] is called again.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::session::{ConnectionState, RealtimeSession};
use crate::error::SessionError;

pub struct SessionManager {
    session: Arc<RealtimeSession>,
    max_attempts: u32,
    interval: Duration,
    active: AtomicBool,
    exhausted: AtomicBool,
    attempts: AtomicU32,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    /// Manage `session` with the reconnection limits from its config.
    pub fn new(session: Arc<RealtimeSession>) -> Self {
        let max_attempts = session.config().max_reconnect_attempts;
        let interval = session.config().reconnect_interval;
        Self {
            session,
            max_attempts,
            interval,
            active: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            monitor: Mutex::new(None),
        }
    }

    pub fn session(&self) -> &Arc<RealtimeSession> {
        &self.session
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Whether the last retry loop gave up.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    /// Reconnection attempts made since the last successful connect.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Mark the system active, start monitoring and connect.
    ///
    /// A failed initial connect is returned, and the monitor retries it.
    pub async fn start(self: &Arc<Self>) -> Result<(), SessionError> {
        self.active.store(true, Ordering::SeqCst);
        self.exhausted.store(false, Ordering::SeqCst);
        self.attempts.store(0, Ordering::SeqCst);

        {
            let mut monitor = self.monitor.lock().await;
            if monitor.as_ref().is_none_or(|task| task.is_finished()) {
                let rx = self.session.subscribe_state();
                *monitor = Some(tokio::spawn(Self::monitor(Arc::downgrade(self), rx)));
            }
        }

        info!("Session manager started");
        self.session.connect().await.inspect_err(|e| {
            warn!(error = %e, "Initial realtime connect failed");
        })
    }

    /// Stop reconnecting and close the session.
    pub async fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(task) = self.monitor.lock().await.take() {
            task.abort();
        }
        self.session.disconnect().await;
        info!("Session manager stopped");
    }

    fn should_reconnect(&self) -> bool {
        self.is_active() && !self.is_exhausted()
    }

    async fn monitor(manager: Weak<Self>, mut rx: watch::Receiver<ConnectionState>) {
        while rx.changed().await.is_ok() {
            let state = rx.borrow_and_update().clone();
            let Some(manager) = manager.upgrade() else {
                return;
            };
            if state.is_down() && manager.should_reconnect() {
                manager.reconnect_loop().await;
            }
        }
    }

    async fn reconnect_loop(&self) {
        loop {
            if !self.is_active() {
                return;
            }
            let attempt = self.attempts.load(Ordering::SeqCst);
            if attempt >= self.max_attempts {
                self.exhausted.store(true, Ordering::SeqCst);
                let reason = format!("Failed to reconnect after {} attempts", self.max_attempts);
                error!(attempts = self.max_attempts, "{reason}");
                self.session.force_error(reason);
                return;
            }
            let attempt = attempt + 1;
            self.attempts.store(attempt, Ordering::SeqCst);

            tokio::time::sleep(self.interval).await;
            if !self.is_active() {
                return;
            }

            info!(attempt, max = self.max_attempts, "Reconnecting realtime session");
            match self.session.connect().await {
                Ok(()) => {
                    self.attempts.store(0, Ordering::SeqCst);
                    info!(attempt, "Realtime session reconnected");
                    return;
                }
                Err(e) => warn!(attempt, error = %e, "Reconnection attempt failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RealtimeConfig;
    use crate::realtime::transport::test_support::MockTransport;

    const WAIT: Duration = Duration::from_secs(3);

    fn manager_with(transport: Arc<MockTransport>, max_attempts: u32) -> Arc<SessionManager> {
        let config = RealtimeConfig {
            max_reconnect_attempts: max_attempts,
            reconnect_interval: Duration::from_millis(10),
            ..RealtimeConfig::default()
        };
        let session = Arc::new(RealtimeSession::new(config, transport));
        Arc::new(SessionManager::new(session))
    }

    async fn wait_for_state(manager: &SessionManager, expected: ConnectionState) {
        let mut rx = manager.session().subscribe_state();
        tokio::time::timeout(WAIT, rx.wait_for(|s| *s == expected))
            .await
            .expect("timed out waiting for state")
            .expect("state channel closed");
    }

    #[tokio::test]
    async fn reconnects_after_peer_close() {
        let transport = MockTransport::new();
        let manager = manager_with(transport.clone(), 3);
        manager.start().await.unwrap();

        transport.take_peer().unwrap().close();

        tokio::time::timeout(WAIT, async {
            while transport.opens() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        wait_for_state(&manager, ConnectionState::Connected).await;
        assert_eq!(manager.attempts(), 0);
        manager.stop().await;
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let transport = MockTransport::new();
        let manager = manager_with(transport.clone(), 3);
        manager.start().await.unwrap();

        transport.set_failures(u32::MAX);
        transport.take_peer().unwrap().close();

        wait_for_state(
            &manager,
            ConnectionState::Error("Failed to reconnect after 3 attempts".into()),
        )
        .await;
        assert!(manager.is_exhausted());
        assert_eq!(transport.opens(), 1 + 3);

        // No further retries once exhausted.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(transport.opens(), 1 + 3);
        manager.stop().await;
    }

    #[tokio::test]
    async fn start_after_exhaustion_tries_again() {
        let transport = MockTransport::new();
        let manager = manager_with(transport.clone(), 1);
        manager.start().await.unwrap();

        transport.set_failures(u32::MAX);
        transport.take_peer().unwrap().close();
        wait_for_state(
            &manager,
            ConnectionState::Error("Failed to reconnect after 1 attempts".into()),
        )
        .await;

        transport.set_failures(0);
        manager.start().await.unwrap();
        assert!(manager.session().state().is_connected());
        assert!(!manager.is_exhausted());
        manager.stop().await;
    }

    #[tokio::test]
    async fn failed_initial_connect_is_retried() {
        let transport = MockTransport::failing(1);
        let manager = manager_with(transport.clone(), 3);
        assert!(manager.start().await.is_err());

        wait_for_state(&manager, ConnectionState::Connected).await;
        assert_eq!(transport.opens(), 2);
        assert_eq!(manager.attempts(), 0);
        manager.stop().await;
    }

    #[tokio::test]
    async fn stop_prevents_reconnection() {
        let transport = MockTransport::new();
        let manager = manager_with(transport.clone(), 3);
        manager.start().await.unwrap();

        manager.stop().await;
        assert_eq!(manager.session().state(), ConnectionState::Disconnected);
        assert!(!manager.is_active());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(transport.opens(), 1);
    }
}
