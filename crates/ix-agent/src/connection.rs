//! Broker connection lifecycle.
//!
//! [`ConnectionManager`] owns the single broker session. Each connection
//! attempt is tagged with a fresh epoch; the session's callbacks carry that
//! epoch and are dropped unless it still matches the manager's slot, so a
//! superseded session can never dispatch a message or trigger a reconnect.
//!
//! Reconnects are requested through a channel and carried out by the
//! [`Reconnector`] returned from [`ConnectionManager::new`], which the
//! caller must drive:
//! ```ignore
//! let (manager, reconnector) = ConnectionManager::new(config, broker, sink);
//! manager.start().await;
//! tokio::spawn(reconnector.run());
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::mpsc;

use ix_mqtt_channel::{
    Broker, ConnectRequest, InboundMessage, MqttError, QoS, Session, SessionHandler,
};

use crate::credentials::{CredentialError, CredentialProvider};
use crate::dispatch::MessageSink;

/// Default wait between a failure and the next connection attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Immutable session parameters, built once at startup.
#[derive(Clone)]
pub struct SessionConfig {
    pub client_id: String,
    pub username: String,
    pub credentials: Arc<dyn CredentialProvider>,
    pub topic: String,
    pub qos: QoS,
    pub reconnect_delay: Duration,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("credentials", &self.credentials.kind())
            .field("topic", &self.topic)
            .field("qos", &self.qos)
            .field("reconnect_delay", &self.reconnect_delay)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
}

/// Why a connection attempt failed. All variants are recoverable.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("credential generation failed: {0}")]
    Credential(#[from] CredentialError),
    #[error("connect failed: {0}")]
    Connect(#[source] MqttError),
    #[error("subscribe failed: {0}")]
    Subscribe(#[source] MqttError),
}

/// The owned-handle slot. Only `start()` and `stop()` replace the session.
struct Slot {
    epoch: u64,
    state: ConnectionState,
    session: Option<Box<dyn Session>>,
}

struct Inner {
    config: SessionConfig,
    broker: Arc<dyn Broker>,
    sink: MessageSink,
    slot: Mutex<Slot>,
    reconnects: mpsc::UnboundedSender<u64>,
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move `epoch` to `Reconnecting` and request a new attempt. No-op if
    /// the epoch is stale or a reconnect is already pending for it.
    fn schedule_reconnect(&self, epoch: u64) -> bool {
        {
            let mut slot = self.slot();
            if slot.epoch != epoch || slot.state == ConnectionState::Reconnecting {
                return false;
            }
            slot.state = ConnectionState::Reconnecting;
        }

        tracing::warn!(
            epoch,
            delay_secs = self.config.reconnect_delay.as_secs(),
            "reconnect scheduled"
        );
        let _ = self.reconnects.send(epoch);
        true
    }
}

/// Callbacks bound to one connection attempt.
struct EpochHandler {
    epoch: u64,
    inner: Weak<Inner>,
}

impl SessionHandler for EpochHandler {
    fn on_message(&self, message: InboundMessage) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };

        if inner.slot().epoch != self.epoch {
            tracing::trace!(epoch = self.epoch, "dropping message from stale session");
            return false;
        }

        tracing::info!(
            topic = %message.topic,
            payload = %message.payload_text(),
            "message received"
        );

        // Checked again and held across the push so stop() cannot slip in between.
        let slot = inner.slot();
        if slot.epoch != self.epoch {
            tracing::debug!(epoch = self.epoch, "session superseded while receiving");
            return false;
        }
        inner.sink.push(message)
    }

    fn on_connection_lost(&self, reason: String) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };

        if inner.slot().epoch != self.epoch {
            tracing::trace!(epoch = self.epoch, "ignoring loss of stale session");
            return;
        }

        tracing::warn!(epoch = self.epoch, reason = %reason, "connection lost");
        inner.schedule_reconnect(self.epoch);
    }
}

/// Owner of the single broker session. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Returns the manager and the reconnect driver the caller must run.
    pub fn new(
        config: SessionConfig,
        broker: Arc<dyn Broker>,
        sink: MessageSink,
    ) -> (Self, Reconnector) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Self {
            inner: Arc::new(Inner {
                config,
                broker,
                sink,
                slot: Mutex::new(Slot {
                    epoch: 0,
                    state: ConnectionState::Disconnected,
                    session: None,
                }),
                reconnects: tx,
            }),
        };
        let reconnector = Reconnector {
            manager: manager.clone(),
            requests: rx,
        };
        (manager, reconnector)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.slot().state
    }

    /// Epoch of the current (or last) connection attempt.
    pub fn epoch(&self) -> u64 {
        self.inner.slot().epoch
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.inner.config.reconnect_delay
    }

    /// Make one connection attempt. On failure a reconnect is scheduled;
    /// nothing is propagated. Returns the state after the attempt.
    pub async fn start(&self) -> ConnectionState {
        let (epoch, previous) = {
            let mut slot = self.inner.slot();
            slot.epoch += 1;
            slot.state = ConnectionState::Connecting;
            (slot.epoch, slot.session.take())
        };

        // A session lost earlier is still held until replaced.
        if let Some(previous) = previous {
            if let Err(e) = previous.disconnect().await {
                tracing::debug!(error = %e, "closing previous session");
            }
        }

        match self.attempt(epoch).await {
            Ok(session) => {
                let superseded = {
                    let mut slot = self.inner.slot();
                    if slot.epoch == epoch && slot.state == ConnectionState::Connecting {
                        slot.session = Some(session);
                        slot.state = ConnectionState::Connected;
                        None
                    } else {
                        Some(session)
                    }
                };

                match superseded {
                    None => {
                        tracing::info!(epoch, topic = %self.inner.config.topic, "connected");
                    }
                    Some(session) => {
                        tracing::info!(epoch, "attempt superseded, closing its session");
                        if let Err(e) = session.disconnect().await {
                            tracing::debug!(error = %e, "closing superseded session");
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!(epoch, error = %e, "connection attempt failed");
                self.inner.schedule_reconnect(epoch);
            }
        }

        self.state()
    }

    async fn attempt(&self, epoch: u64) -> Result<Box<dyn Session>, ConnectError> {
        let config = &self.inner.config;

        let request = ConnectRequest {
            client_id: config.client_id.clone(),
            username: config.username.clone(),
            password: config.credentials.credential()?,
        };
        let handler = Arc::new(EpochHandler {
            epoch,
            inner: Arc::downgrade(&self.inner),
        });

        let session = self
            .inner
            .broker
            .connect(request, handler)
            .await
            .map_err(ConnectError::Connect)?;

        if let Err(e) = session.subscribe(&config.topic, config.qos).await {
            if let Err(close) = session.disconnect().await {
                tracing::debug!(error = %close, "closing session after failed subscribe");
            }
            return Err(ConnectError::Subscribe(e));
        }

        Ok(session)
    }

    /// Drop the current session. Without one this performs no transport
    /// operation; pending reconnects are cancelled either way.
    pub async fn stop(&self) {
        let (epoch, session) = {
            let mut slot = self.inner.slot();
            slot.epoch += 1;
            match slot.session.take() {
                Some(session) => {
                    slot.state = ConnectionState::Disconnecting;
                    (slot.epoch, session)
                }
                None => {
                    slot.state = ConnectionState::Disconnected;
                    return;
                }
            }
        };

        tracing::info!("disconnecting");
        if let Err(e) = session.disconnect().await {
            tracing::warn!(error = %e, "disconnect failed");
        }

        let mut slot = self.inner.slot();
        if slot.epoch == epoch {
            slot.state = ConnectionState::Disconnected;
        }
    }

    /// Whether a reconnect requested for `epoch` should still run.
    fn reconnect_pending(&self, epoch: u64) -> bool {
        let slot = self.inner.slot();
        slot.epoch == epoch && slot.state == ConnectionState::Reconnecting
    }
}

/// Drives scheduled reconnects: waits the fixed delay, then calls
/// [`ConnectionManager::start`] again. Retries forever.
pub struct Reconnector {
    manager: ConnectionManager,
    requests: mpsc::UnboundedReceiver<u64>,
}

impl Reconnector {
    pub async fn run(mut self) {
        let delay = self.manager.reconnect_delay();
        while let Some(epoch) = self.requests.recv().await {
            tokio::time::sleep(delay).await;

            if !self.manager.reconnect_pending(epoch) {
                tracing::debug!(epoch, "reconnect cancelled");
                continue;
            }
            self.manager.start().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ix_mqtt_channel::MockBroker;
    use tokio::time::Instant;

    use crate::credentials::StaticCredential;
    use crate::dispatch::{self, MessageQueue};

    /// Hands out "token-1", "token-2", ... so freshness is observable.
    #[derive(Default)]
    struct CountingCredential {
        calls: AtomicUsize,
    }

    impl CredentialProvider for CountingCredential {
        fn credential(&self) -> Result<String, CredentialError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("token-{n}"))
        }

        fn kind(&self) -> &'static str {
            "counting"
        }
    }

    fn config(credentials: Arc<dyn CredentialProvider>) -> SessionConfig {
        SessionConfig {
            client_id: "projects/p/locations/us/devices/dev1".into(),
            username: "mqtt".into(),
            credentials,
            topic: "/devices/dev1/commands/#".into(),
            qos: QoS::AtMostOnce,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    fn setup() -> (ConnectionManager, Reconnector, MockBroker, MessageQueue) {
        let broker = MockBroker::new();
        let (sink, queue) = dispatch::queue();
        let (manager, reconnector) = ConnectionManager::new(
            config(Arc::new(CountingCredential::default())),
            Arc::new(broker.clone()),
            sink,
        );
        (manager, reconnector, broker, queue)
    }

    /// Poll (in virtual time) until `broker` has seen `n` connect attempts.
    async fn wait_for_attempts(broker: &MockBroker, n: usize) {
        for _ in 0..1000 {
            if broker.attempts().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("expected {n} attempts, saw {}", broker.attempts().len());
    }

    #[tokio::test]
    async fn starts_disconnected() {
        let (manager, _reconnector, broker, _queue) = setup();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(broker.attempts().is_empty());
    }

    #[tokio::test]
    async fn start_connects_and_subscribes() {
        let (manager, _reconnector, broker, _queue) = setup();

        assert_eq!(manager.start().await, ConnectionState::Connected);

        let attempts = broker.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].request.client_id, "projects/p/locations/us/devices/dev1");
        assert_eq!(attempts[0].request.username, "mqtt");
        assert_eq!(attempts[0].request.password, "token-1");
        assert_eq!(
            broker.subscriptions(0),
            vec![("/devices/dev1/commands/#".to_string(), QoS::AtMostOnce)]
        );
    }

    #[tokio::test]
    async fn delivered_message_reaches_queue() {
        let (manager, _reconnector, broker, mut queue) = setup();
        manager.start().await;

        assert!(broker.deliver(0, "/devices/dev1/commands", b"reboot"));

        let message = queue.next().await.unwrap();
        assert_eq!(message.topic, "/devices/dev1/commands");
        assert_eq!(message.payload, b"reboot");
    }

    #[tokio::test]
    async fn large_payload_reaches_queue_intact() {
        let (manager, _reconnector, broker, mut queue) = setup();
        manager.start().await;

        let payload: Vec<u8> = (0..=255u8).cycle().take(512 * 1024).collect();
        assert!(broker.deliver(0, "/devices/dev1/commands", &payload));
        assert_eq!(queue.next().await.unwrap().payload, payload);

        manager.stop().await;
        assert!(!broker.deliver(0, "/devices/dev1/commands", &payload));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn connect_failure_schedules_reconnect() {
        let (manager, _reconnector, broker, _queue) = setup();
        broker.fail_next_connect("connection refused");

        assert_eq!(manager.start().await, ConnectionState::Reconnecting);
        assert_eq!(broker.session_count(), 0);
    }

    #[tokio::test]
    async fn subscribe_failure_closes_session_and_reconnects() {
        let (manager, _reconnector, broker, _queue) = setup();
        broker.fail_next_subscribe("not authorized");

        assert_eq!(manager.start().await, ConnectionState::Reconnecting);
        assert_eq!(broker.disconnects(0), 1);
    }

    #[tokio::test]
    async fn credential_failure_schedules_reconnect() {
        struct Broken;
        impl CredentialProvider for Broken {
            fn credential(&self) -> Result<String, CredentialError> {
                Err(CredentialError::Signing(
                    jsonwebtoken::errors::ErrorKind::RsaFailedSigning.into(),
                ))
            }
            fn kind(&self) -> &'static str {
                "broken"
            }
        }

        let broker = MockBroker::new();
        let (sink, _queue) = dispatch::queue();
        let (manager, _reconnector) =
            ConnectionManager::new(config(Arc::new(Broken)), Arc::new(broker.clone()), sink);

        assert_eq!(manager.start().await, ConnectionState::Reconnecting);
        assert!(broker.attempts().is_empty());
    }

    #[tokio::test]
    async fn stale_message_is_ignored() {
        let (manager, _reconnector, broker, queue) = setup();
        manager.start().await;
        broker.drop_connection(0, "eof");
        manager.start().await;
        assert_eq!(broker.session_count(), 2);

        assert!(!broker.deliver(0, "t", b"old"));
        assert!(queue.is_empty());
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn stale_connection_loss_is_ignored() {
        let (manager, _reconnector, broker, _queue) = setup();
        manager.start().await;
        broker.drop_connection(0, "eof");
        manager.start().await;
        let epoch = manager.epoch();

        broker.drop_connection(0, "late eof");

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.epoch(), epoch);
    }

    #[tokio::test]
    async fn events_after_stop_are_ignored() {
        let (manager, _reconnector, broker, queue) = setup();
        manager.start().await;
        manager.stop().await;

        assert!(!broker.deliver(0, "t", b"late"));
        broker.drop_connection(0, "eof");

        assert!(queue.is_empty());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn current_connection_loss_moves_to_reconnecting() {
        let (manager, _reconnector, broker, _queue) = setup();
        manager.start().await;

        broker.drop_connection(0, "keep-alive timeout");
        assert_eq!(manager.state(), ConnectionState::Reconnecting);

        // A second loss report for the same session does not double-schedule.
        broker.drop_connection(0, "eof");
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
    }

    #[tokio::test]
    async fn restart_closes_lost_session() {
        let (manager, _reconnector, broker, _queue) = setup();
        manager.start().await;
        broker.drop_connection(0, "eof");
        manager.start().await;

        assert_eq!(broker.disconnects(0), 1);
        assert_eq!(broker.disconnects(1), 0);
    }

    #[tokio::test]
    async fn stop_disconnects_once() {
        let (manager, _reconnector, broker, _queue) = setup();
        manager.start().await;

        manager.stop().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(broker.disconnects(0), 1);

        manager.stop().await;
        assert_eq!(broker.total_disconnects(), 1);
    }

    #[tokio::test]
    async fn stop_without_session_is_a_no_op() {
        let (manager, _reconnector, broker, _queue) = setup();
        manager.stop().await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(broker.attempts().is_empty());
        assert_eq!(broker.total_disconnects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_waits_delay_and_uses_fresh_credential() {
        let (manager, reconnector, broker, _queue) = setup();
        tokio::spawn(reconnector.run());

        manager.start().await;
        let lost_at = Instant::now();
        broker.drop_connection(0, "eof");

        wait_for_attempts(&broker, 2).await;

        let attempts = broker.attempts();
        assert!(attempts[1].at - lost_at >= DEFAULT_RECONNECT_DELAY);
        assert_eq!(attempts[0].request.password, "token-1");
        assert_eq!(attempts[1].request.password, "token-2");
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_indefinitely_at_fixed_delay() {
        let (manager, reconnector, broker, _queue) = setup();
        for _ in 0..3 {
            broker.fail_next_connect("connection refused");
        }
        tokio::spawn(reconnector.run());

        manager.start().await;
        wait_for_attempts(&broker, 4).await;

        let attempts = broker.attempts();
        for pair in attempts.windows(2) {
            assert!(pair[1].at - pair[0].at >= DEFAULT_RECONNECT_DELAY);
        }
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_reconnect() {
        let (manager, reconnector, broker, _queue) = setup();
        tokio::spawn(reconnector.run());

        manager.start().await;
        broker.drop_connection(0, "eof");
        manager.stop().await;

        tokio::time::sleep(DEFAULT_RECONNECT_DELAY * 3).await;
        assert_eq!(broker.attempts().len(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn static_credential_is_presented_on_every_attempt() {
        let broker = MockBroker::new();
        let (sink, _queue) = dispatch::queue();
        let (manager, _reconnector) = ConnectionManager::new(
            config(Arc::new(StaticCredential::new("s3cret"))),
            Arc::new(broker.clone()),
            sink,
        );

        manager.start().await;
        broker.drop_connection(0, "eof");
        manager.start().await;

        assert!(
            broker
                .attempts()
                .iter()
                .all(|a| a.request.password == "s3cret")
        );
    }
}
