//! ix relay agent: subscribes to one MQTT topic and pipes every message
//! into a local command.
//!
//! Wires configuration, credentials, the trust bundle and the broker
//! session into a single long-running binary.

use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing_subscriber::EnvFilter;

use ix_agent::cli::Cli;
use ix_agent::command::ProcessRunner;
use ix_agent::connection::ConnectionManager;
use ix_agent::dispatch::{self, Dispatcher};
use ix_mqtt_channel::{RumqttBroker, TrustBundle};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "ix-agent starting");

    // ── Load config ─────────────────────────────────────────────
    let cli = Cli::parse();
    let config = cli.load_config()?;

    let credentials = config.credential_provider()?;
    // Mint once so a key that cannot sign fails startup, not the first connect.
    credentials.credential()?;
    let session = config.session_config(credentials)?;
    tracing::info!(
        client_id = %session.client_id,
        topic = %session.topic,
        credentials = session.credentials.kind(),
        command = %config.command,
        "config loaded"
    );

    // ── Broker ──────────────────────────────────────────────────
    let trust = if config.mqtt.use_tls {
        Some(TrustBundle::load(&config.mqtt.ca_cert).await?)
    } else {
        tracing::info!("MQTT plaintext mode (no TLS)");
        None
    };
    let broker = RumqttBroker::new(&config.mqtt, trust)?;

    // ── Wiring ──────────────────────────────────────────────────
    let (sink, queue) = dispatch::queue();
    let (manager, reconnector) = ConnectionManager::new(session, Arc::new(broker), sink);
    let dispatcher = Dispatcher::new(ProcessRunner::new(&config.command));

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        // Initial connect, then scheduled reconnects forever
        () = async {
            manager.start().await;
            reconnector.run().await;
        } => {
            tracing::error!("reconnect loop exited unexpectedly");
        }
        // Run the command for each queued message, in order
        () = dispatcher.run(queue) => {
            tracing::error!("dispatch loop exited unexpectedly");
        }
        _ = sigint.recv() => {
            tracing::info!("interrupt received, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("SIGTERM received, shutting down");
        }
    }

    // Every branch above ends here; an in-flight command is not cancelled.
    manager.stop().await;
    tracing::info!("ix-agent stopped");
    Ok(())
}
