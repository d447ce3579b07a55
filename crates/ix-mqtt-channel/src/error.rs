//! MQTT channel error types.

use thiserror::Error;

/// Errors that can occur while talking to the broker.
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("subscribe error: {0}")]
    Subscribe(String),

    #[error("disconnect error: {0}")]
    Disconnect(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("PEM parse failed: {0}")]
    Pem(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Convenience alias for MQTT results.
pub type MqttResult<T> = Result<T, MqttError>;
