//! Agent configuration, loadable from TOML and overridable from the CLI.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ix_mqtt_channel::MqttConfig;
use serde::Deserialize;

use crate::connection::SessionConfig;
use crate::credentials::{
    CredentialError, CredentialProvider, SignedTokenCredential, StaticCredential,
    audience_from_client_id,
};

/// Top-level configuration for the relay agent.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// MQTT connection settings.
    #[serde(default)]
    pub mqtt: MqttConfig,
    /// Broker authentication.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Program run once per message, payload on stdin.
    #[serde(default)]
    pub command: String,
    /// Fixed delay between reconnect attempts, in seconds.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

/// Broker authentication settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Static password. Takes precedence over JWT when non-empty.
    #[serde(default)]
    pub password: Option<String>,
    /// RSA private key (PEM) used to sign JWT passwords.
    #[serde(default)]
    pub jwt_private_key: Option<PathBuf>,
    /// JWT audience. Derived from `projects/<id>` in the client ID if unset.
    #[serde(default)]
    pub jwt_audience: Option<String>,
}

fn default_reconnect_delay() -> u64 {
    10
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig::default(),
            auth: AuthConfig::default(),
            command: String::new(),
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

/// Fatal configuration problems, reported before any connection attempt.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error("either a password or a JWT private key must be provided")]
    NoCredentials,
    #[error("cannot derive JWT audience from client ID '{0}'; set it explicitly")]
    NoAudience(String),
    #[error("invalid setting: {0}")]
    Invalid(String),
    #[error(transparent)]
    Credential(#[from] CredentialError),
}

/// Where broker passwords come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    Password(String),
    SignedToken {
        private_key: PathBuf,
        audience: String,
    },
}

impl AgentConfig {
    /// Load config from a TOML file path.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// Check required settings and resolve the credential source.
    pub fn validate(&self) -> Result<CredentialSource, ConfigError> {
        if self.mqtt.topic.is_empty() {
            return Err(ConfigError::Missing("mqtt.topic"));
        }
        if self.mqtt.client_id.is_empty() {
            return Err(ConfigError::Missing("mqtt.client_id"));
        }
        if self.mqtt.use_tls && self.mqtt.ca_cert.is_empty() {
            return Err(ConfigError::Missing("mqtt.ca_cert"));
        }
        if self.command.is_empty() {
            return Err(ConfigError::Missing("command"));
        }
        if self.reconnect_delay_secs == 0 {
            return Err(ConfigError::Invalid(
                "reconnect_delay_secs must be at least 1".into(),
            ));
        }
        if self.mqtt.max_packet_size == 0 {
            return Err(ConfigError::Invalid(
                "mqtt.max_packet_size must be positive".into(),
            ));
        }
        self.mqtt
            .subscribe_qos()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if let Some(password) = self.auth.password.as_deref().filter(|p| !p.is_empty()) {
            return Ok(CredentialSource::Password(password.to_string()));
        }

        let private_key = self
            .auth
            .jwt_private_key
            .clone()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or(ConfigError::NoCredentials)?;

        let audience = match self.auth.jwt_audience.as_deref().filter(|a| !a.is_empty()) {
            Some(audience) => audience.to_string(),
            None => audience_from_client_id(&self.mqtt.client_id)
                .ok_or_else(|| ConfigError::NoAudience(self.mqtt.client_id.clone()))?,
        };

        Ok(CredentialSource::SignedToken {
            private_key,
            audience,
        })
    }

    /// Validate and load the credential provider (reads the signing key).
    pub fn credential_provider(&self) -> Result<Arc<dyn CredentialProvider>, ConfigError> {
        let provider: Arc<dyn CredentialProvider> = match self.validate()? {
            CredentialSource::Password(password) => Arc::new(StaticCredential::new(password)),
            CredentialSource::SignedToken {
                private_key,
                audience,
            } => Arc::new(SignedTokenCredential::from_file(&private_key, audience)?),
        };
        Ok(provider)
    }

    pub fn session_config(
        &self,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<SessionConfig, ConfigError> {
        Ok(SessionConfig {
            client_id: self.mqtt.client_id.clone(),
            username: self.mqtt.username.clone(),
            credentials,
            topic: self.mqtt.topic.clone(),
            qos: self
                .mqtt
                .subscribe_qos()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?,
            reconnect_delay: self.reconnect_delay(),
        })
    }
}
