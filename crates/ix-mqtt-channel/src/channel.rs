//! Broker sessions over rumqttc.
//!
//! Every `connect()` builds a fresh `AsyncClient`/`EventLoop` pair so each
//! attempt carries its own credentials. The event loop is driven on a
//! spawned task that forwards publishes and connection loss to the
//! session's [`SessionHandler`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubAck,
    SubscribeReasonCode, Transport,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::MqttConfig;
use crate::error::{MqttError, MqttResult};
use crate::handler::{InboundMessage, SessionHandler};
use crate::tls::{self, TrustBundle};

/// How long `disconnect()` lets the I/O task write the DISCONNECT packet.
/// Unacknowledged publishes are never waited for; the task stops as soon
/// as the packet is out.
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Capacity of rumqttc's request channel.
const REQUEST_CAPACITY: usize = 64;

// ── Traits ────────────────────────────────────────────────────

/// Per-attempt authentication presented to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub client_id: String,
    pub username: String,
    pub password: String,
}

/// Opens authenticated broker sessions.
///
/// Mockable in tests without a real MQTT broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Connect and wait for the broker to accept the session. Events of
    /// the new session are delivered to `handler`.
    async fn connect(
        &self,
        request: ConnectRequest,
        handler: Arc<dyn SessionHandler>,
    ) -> MqttResult<Box<dyn Session>>;
}

/// A single live broker session.
#[async_trait]
pub trait Session: Send + Sync {
    /// Subscribe to a topic filter and wait for the SUBACK.
    async fn subscribe(&self, topic: &str, qos: QoS) -> MqttResult<()>;

    /// Disconnect without waiting for in-flight acknowledgements. Returns
    /// once the DISCONNECT packet is written or a short grace period ends.
    async fn disconnect(&self) -> MqttResult<()>;
}

// ── RumqttBroker ──────────────────────────────────────────────

/// Broker endpoint reached through rumqttc.
pub struct RumqttBroker {
    host: String,
    port: u16,
    keep_alive: Duration,
    connect_timeout: Duration,
    max_packet_size: usize,
    trust: Option<TrustBundle>,
}

impl RumqttBroker {
    /// `trust` is required when `config.use_tls` is set.
    pub fn new(config: &MqttConfig, trust: Option<TrustBundle>) -> MqttResult<Self> {
        if config.use_tls && trust.is_none() {
            return Err(MqttError::Config("TLS enabled but no trust bundle".into()));
        }

        Ok(Self {
            host: config.broker_host.clone(),
            port: config.broker_port,
            keep_alive: config.keep_alive(),
            connect_timeout: config.connect_timeout(),
            max_packet_size: config.max_packet_size,
            trust: if config.use_tls { trust } else { None },
        })
    }

    pub fn address(&self) -> String {
        let scheme = if self.trust.is_some() { "tls" } else { "tcp" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    fn transport(&self) -> Transport {
        match &self.trust {
            Some(bundle) => bundle.transport(),
            None => tls::plaintext_transport(),
        }
    }

    fn options(&self, request: &ConnectRequest) -> MqttResult<MqttOptions> {
        if request.client_id.is_empty() || request.client_id.starts_with(' ') {
            return Err(MqttError::Config(format!(
                "invalid client id '{}'",
                request.client_id
            )));
        }

        let mut options = MqttOptions::new(&request.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_credentials(&request.username, &request.password);
        options.set_clean_session(true);
        options.set_manual_acks(true);
        options.set_max_packet_size(self.max_packet_size, self.max_packet_size);
        options.set_transport(self.transport());
        Ok(options)
    }
}

#[async_trait]
impl Broker for RumqttBroker {
    async fn connect(
        &self,
        request: ConnectRequest,
        handler: Arc<dyn SessionHandler>,
    ) -> MqttResult<Box<dyn Session>> {
        let options = self.options(&request)?;
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        tracing::info!(address = %self.address(), client_id = %request.client_id, "connecting");
        tokio::time::timeout(self.connect_timeout, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| MqttError::Timeout("CONNACK"))??;

        let (suback_tx, suback_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(drive(eventloop, client.clone(), handler, suback_tx));

        Ok(Box::new(RumqttSession {
            client,
            subacks: tokio::sync::Mutex::new(suback_rx),
            ack_timeout: self.connect_timeout,
            task: Mutex::new(Some(task)),
        }))
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> MqttResult<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(MqttError::Connection(format!("broker refused: {code:?}"))),
                };
            }
            Ok(_) => {}
            Err(e) => return Err(MqttError::Connection(e.to_string())),
        }
    }
}

/// Drive the event loop until the connection drops or we disconnect.
async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    handler: Arc<dyn SessionHandler>,
    subacks: mpsc::UnboundedSender<SubAck>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if handler.on_message(InboundMessage::from_publish(&publish)) {
                    // try_ack: the request channel is drained by this very task.
                    if let Err(e) = client.try_ack(&publish) {
                        tracing::warn!(error = %e, pkid = publish.pkid, "failed to ack publish");
                    }
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let _ = subacks.send(ack);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::debug!("disconnect sent, stopping event loop");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                handler.on_connection_lost(e.to_string());
                return;
            }
        }
    }
}

// ── RumqttSession ─────────────────────────────────────────────

struct RumqttSession {
    client: AsyncClient,
    subacks: tokio::sync::Mutex<mpsc::UnboundedReceiver<SubAck>>,
    ack_timeout: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RumqttSession {
    fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

#[async_trait]
impl Session for RumqttSession {
    async fn subscribe(&self, topic: &str, qos: QoS) -> MqttResult<()> {
        let mut subacks = self.subacks.lock().await;

        self.client
            .subscribe(topic, qos)
            .await
            .map_err(|e| MqttError::Subscribe(e.to_string()))?;

        let ack = tokio::time::timeout(self.ack_timeout, subacks.recv())
            .await
            .map_err(|_| MqttError::Timeout("SUBACK"))?
            .ok_or_else(|| MqttError::Subscribe("session closed before SUBACK".into()))?;

        if ack
            .return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
        {
            return Err(MqttError::Subscribe(format!("broker rejected '{topic}'")));
        }
        Ok(())
    }

    async fn disconnect(&self) -> MqttResult<()> {
        let sent = self
            .client
            .try_disconnect()
            .map_err(|e| MqttError::Disconnect(e.to_string()));

        if let Some(mut task) = self.take_task() {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        sent
    }
}

impl Drop for RumqttSession {
    fn drop(&mut self) {
        if let Some(task) = self.take_task() {
            task.abort();
        }
    }
}
