//! MQTT channel for the ix relay agent.
//!
//! Provides the broker-facing half of the agent:
//! - `Broker` / `Session` traits (mockable in tests)
//! - `RumqttBroker` over TLS for production
//! - `TrustBundle` loading from a file or URL
//! - `MockBroker` for testing without a broker
//! - `SessionHandler` callbacks carrying `InboundMessage`s

pub mod channel;
pub mod config;
pub mod error;
pub mod handler;
pub mod mock;
pub mod tls;

// Re-exports for convenience.
pub use channel::{Broker, ConnectRequest, RumqttBroker, Session};
pub use config::MqttConfig;
pub use error::{MqttError, MqttResult};
pub use handler::{InboundMessage, SessionHandler};
pub use mock::MockBroker;
pub use rumqttc::QoS;
pub use tls::TrustBundle;
