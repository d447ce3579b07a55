//! Mock broker for testing without a real MQTT server.
//!
//! Records every connect request, subscription and disconnect, and lets
//! tests push messages or connection loss through the handler bound to
//! any session it handed out.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rumqttc::QoS;
use tokio::time::Instant;

use crate::channel::{Broker, ConnectRequest, Session};
use crate::error::{MqttError, MqttResult};
use crate::handler::{InboundMessage, SessionHandler};

/// A recorded connect attempt.
#[derive(Clone)]
pub struct ConnectAttempt {
    pub request: ConnectRequest,
    pub at: Instant,
    /// Index of the session created, `None` if the attempt was failed.
    pub session: Option<usize>,
}

struct MockSessionState {
    handler: Arc<dyn SessionHandler>,
    subscriptions: Vec<(String, QoS)>,
    disconnects: usize,
}

#[derive(Default)]
struct MockState {
    attempts: Vec<ConnectAttempt>,
    sessions: Vec<MockSessionState>,
    connect_failures: VecDeque<String>,
    subscribe_failures: VecDeque<String>,
}

/// Mock implementation of the `Broker` trait.
///
/// Cheap to clone; clones share recorded state.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<MockState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next connect attempt with `reason`. Queued in order.
    pub fn fail_next_connect(&self, reason: impl Into<String>) {
        self.state
            .lock()
            .unwrap()
            .connect_failures
            .push_back(reason.into());
    }

    /// Fail the next subscribe call with `reason`. Queued in order.
    pub fn fail_next_subscribe(&self, reason: impl Into<String>) {
        self.state
            .lock()
            .unwrap()
            .subscribe_failures
            .push_back(reason.into());
    }

    /// All connect attempts, successful or not.
    pub fn attempts(&self) -> Vec<ConnectAttempt> {
        self.state.lock().unwrap().attempts.clone()
    }

    /// Number of sessions handed out.
    pub fn session_count(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    pub fn subscriptions(&self, session: usize) -> Vec<(String, QoS)> {
        self.state.lock().unwrap().sessions[session]
            .subscriptions
            .clone()
    }

    pub fn disconnects(&self, session: usize) -> usize {
        self.state.lock().unwrap().sessions[session].disconnects
    }

    /// Total disconnect calls across every session.
    pub fn total_disconnects(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .sessions
            .iter()
            .map(|s| s.disconnects)
            .sum()
    }

    /// Deliver a message through the handler of `session`, as the
    /// transport's I/O task would. Returns whether the handler accepted it.
    pub fn deliver(&self, session: usize, topic: &str, payload: &[u8]) -> bool {
        let handler = self.handler(session);
        handler.on_message(InboundMessage::new(topic, payload))
    }

    /// Report connection loss on `session`.
    pub fn drop_connection(&self, session: usize, reason: &str) {
        let handler = self.handler(session);
        handler.on_connection_lost(reason.to_string());
    }

    fn handler(&self, session: usize) -> Arc<dyn SessionHandler> {
        // Cloned out so the handler never runs under the mock's lock.
        self.state.lock().unwrap().sessions[session].handler.clone()
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn connect(
        &self,
        request: ConnectRequest,
        handler: Arc<dyn SessionHandler>,
    ) -> MqttResult<Box<dyn Session>> {
        let mut state = self.state.lock().unwrap();

        if let Some(reason) = state.connect_failures.pop_front() {
            state.attempts.push(ConnectAttempt {
                request,
                at: Instant::now(),
                session: None,
            });
            return Err(MqttError::Connection(reason));
        }

        let index = state.sessions.len();
        state.sessions.push(MockSessionState {
            handler,
            subscriptions: Vec::new(),
            disconnects: 0,
        });
        state.attempts.push(ConnectAttempt {
            request,
            at: Instant::now(),
            session: Some(index),
        });

        Ok(Box::new(MockSession {
            index,
            state: self.state.clone(),
        }))
    }
}

/// Session handed out by [`MockBroker`].
pub struct MockSession {
    index: usize,
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl Session for MockSession {
    async fn subscribe(&self, topic: &str, qos: QoS) -> MqttResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = state.subscribe_failures.pop_front() {
            return Err(MqttError::Subscribe(reason));
        }
        state.sessions[self.index]
            .subscriptions
            .push((topic.to_string(), qos));
        Ok(())
    }

    async fn disconnect(&self) -> MqttResult<()> {
        self.state.lock().unwrap().sessions[self.index].disconnects += 1;
        Ok(())
    }
}
