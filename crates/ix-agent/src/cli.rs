//! Command-line flags. Every flag overrides the matching setting from the
//! optional TOML file.

use std::path::PathBuf;

use clap::Parser;

use crate::config::AgentConfig;

/// Subscribe to an MQTT topic and pipe every message into a local command.
#[derive(Debug, Parser)]
#[command(name = "ix-agent")]
#[command(version)]
pub struct Cli {
    /// TOML configuration file
    #[arg(short, long, value_name = "FILE", env = "IX_CONFIG")]
    pub config: Option<PathBuf>,

    /// MQTT broker host
    #[arg(long, env = "IX_MQTT_HOST")]
    pub host: Option<String>,

    /// MQTT broker port
    #[arg(long, env = "IX_MQTT_PORT")]
    pub port: Option<u16>,

    /// CA bundle file or URL (fetched when http:// or https://)
    #[arg(long, env = "IX_CA_CERT")]
    pub ca_cert: Option<String>,

    /// Connect without TLS (local development brokers)
    #[arg(long)]
    pub insecure_plaintext: bool,

    /// MQTT client ID
    #[arg(long, env = "IX_CLIENT_ID")]
    pub client_id: Option<String>,

    /// MQTT username
    #[arg(long, env = "IX_USERNAME")]
    pub username: Option<String>,

    /// MQTT password (takes precedence over JWT settings)
    #[arg(long, env = "IX_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// RSA private key (PEM) used to sign JWT passwords
    #[arg(long, value_name = "FILE", env = "IX_JWT_PRIVATE_KEY")]
    pub jwt_private_key: Option<PathBuf>,

    /// JWT audience (derived from `projects/<id>` in the client ID if unset)
    #[arg(long, env = "IX_JWT_AUDIENCE")]
    pub jwt_audience: Option<String>,

    /// MQTT topic to subscribe to
    #[arg(long, env = "IX_TOPIC")]
    pub topic: Option<String>,

    /// Subscription QoS (0, 1 or 2)
    #[arg(long)]
    pub qos: Option<u8>,

    /// Program executed per message with the payload on stdin
    #[arg(long, value_name = "PATH", env = "IX_COMMAND")]
    pub command: Option<String>,

    /// Seconds to wait before reconnecting
    #[arg(long)]
    pub reconnect_delay_secs: Option<u64>,
}

impl Cli {
    /// Read the config file (if any) and apply flag overrides.
    pub fn load_config(&self) -> anyhow::Result<AgentConfig> {
        let mut config = match &self.config {
            Some(path) => AgentConfig::from_file(&path.to_string_lossy())?,
            None => AgentConfig::default(),
        };
        self.apply(&mut config);
        Ok(config)
    }

    pub fn apply(&self, config: &mut AgentConfig) {
        let mqtt = &mut config.mqtt;
        override_with(&mut mqtt.broker_host, &self.host);
        override_with(&mut mqtt.broker_port, &self.port);
        override_with(&mut mqtt.ca_cert, &self.ca_cert);
        override_with(&mut mqtt.client_id, &self.client_id);
        override_with(&mut mqtt.username, &self.username);
        override_with(&mut mqtt.topic, &self.topic);
        override_with(&mut mqtt.qos, &self.qos);
        if self.insecure_plaintext {
            mqtt.use_tls = false;
        }

        let auth = &mut config.auth;
        if self.password.is_some() {
            auth.password = self.password.clone();
        }
        if self.jwt_private_key.is_some() {
            auth.jwt_private_key = self.jwt_private_key.clone();
        }
        if self.jwt_audience.is_some() {
            auth.jwt_audience = self.jwt_audience.clone();
        }

        override_with(&mut config.command, &self.command);
        override_with(&mut config.reconnect_delay_secs, &self.reconnect_delay_secs);
    }
}

fn override_with<T: Clone>(target: &mut T, value: &Option<T>) {
    if let Some(value) = value {
        *target = value.clone();
    }
}
