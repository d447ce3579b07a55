use std::time::Duration;

use rumqttc::QoS;
use serde::Deserialize;

use crate::error::{MqttError, MqttResult};

/// Default packet limit: a 256 KB payload plus topic and header room.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 256 * 1024 + 4 * 1024;

/// MQTT connection configuration, loadable from TOML.
///
/// Defaults target Google Cloud IoT Core.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// MQTT broker hostname.
    pub broker_host: String,
    /// MQTT broker port (default 8883 for TLS).
    pub broker_port: u16,
    /// MQTT client ID, e.g. `projects/p/locations/l/registries/r/devices/d`.
    pub client_id: String,
    /// MQTT username. Cloud IoT ignores it but requires one.
    pub username: String,
    /// Enable TLS. When false, connects plaintext (local dev).
    pub use_tls: bool,
    /// CA bundle, either a file path or an `http(s)://` URL.
    pub ca_cert: String,
    /// Topic to subscribe to.
    pub topic: String,
    /// Subscription QoS level (0, 1 or 2).
    pub qos: u8,
    /// Keep-alive interval in seconds.
    pub keepalive_secs: u64,
    /// Upper bound on waiting for CONNACK / SUBACK.
    pub connect_timeout_secs: u64,
    /// Largest MQTT packet accepted or sent, in bytes. Cloud IoT allows
    /// 256 KB payloads; rumqttc's own default is only 10 KB.
    pub max_packet_size: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "mqtt.googleapis.com".to_string(),
            broker_port: 8883,
            client_id: String::new(),
            username: "mqtt".to_string(),
            use_tls: true,
            ca_cert: "https://pki.goog/roots.pem".to_string(),
            topic: String::new(),
            qos: 0,
            keepalive_secs: 60,
            connect_timeout_secs: 30,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

impl MqttConfig {
    /// Subscription QoS as the rumqttc enum.
    pub fn subscribe_qos(&self) -> MqttResult<QoS> {
        match self.qos {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(MqttError::Config(format!("qos must be 0, 1 or 2, got {other}"))),
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
