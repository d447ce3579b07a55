//! Shared test harness for E2E integration tests.
//!
//! Wires a `MockBroker` through the real `ConnectionManager`, message queue
//! and `Dispatcher`, with a `ProcessRunner` executing a shell script that
//! records every payload it receives on stdin.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;

use ix_agent::command::ProcessRunner;
use ix_agent::connection::{ConnectionManager, SessionConfig};
use ix_agent::credentials::{CredentialError, CredentialProvider};
use ix_agent::dispatch::{self, Dispatcher};
use ix_mqtt_channel::{MockBroker, QoS};

pub const CLIENT_ID: &str = "projects/relay-test/locations/us/registries/r/devices/dev1";
pub const TOPIC: &str = "/devices/dev1/commands/#";
pub const RECONNECT_DELAY: Duration = Duration::from_millis(100);

/// Appends each payload as one line; exits non-zero when the payload is `fail`.
pub const RECORDING_SCRIPT: &str = r#"payload=$(cat)
printf '%s\n' "$payload" >> "$OUT"
[ "$payload" != "fail" ]
"#;

/// Hands out "token-1", "token-2", ... so every connect is distinguishable.
#[derive(Default)]
pub struct CountingCredential {
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

/// Write an executable `/bin/sh` script into `dir`. `$OUT` in `body` is
/// replaced with the path of the output file.
pub fn write_script(dir: &Path, body: &str) -> (PathBuf, PathBuf) {
    let output = dir.join("out.log");
    let script = dir.join("handler.sh");
    let body = body.replace("$OUT", &output.to_string_lossy());
    std::fs::write(&script, format!("#!/bin/sh\n{body}")).unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    (script, output)
}

/// End-to-end harness. Background tasks are aborted on drop.
pub struct TestHarness {
    pub broker: MockBroker,
    pub manager: ConnectionManager,
    /// File the command script appends to.
    pub output: PathBuf,
    _dir: TempDir,
    tasks: Vec<JoinHandle<()>>,
}

impl TestHarness {
    /// Harness running [`RECORDING_SCRIPT`] with [`CountingCredential`].
    pub fn new() -> Self {
        Self::build(RECORDING_SCRIPT, Arc::new(CountingCredential::default()))
    }

    pub fn with_script(body: &str) -> Self {
        Self::build(body, Arc::new(CountingCredential::default()))
    }

    pub fn with_credentials(credentials: Arc<dyn CredentialProvider>) -> Self {
        Self::build(RECORDING_SCRIPT, credentials)
    }

    fn build(body: &str, credentials: Arc<dyn CredentialProvider>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let (script, output) = write_script(dir.path(), body);

        let broker = MockBroker::new();
        let config = SessionConfig {
            client_id: CLIENT_ID.into(),
            username: "unused".into(),
            credentials,
            topic: TOPIC.into(),
            qos: QoS::AtLeastOnce,
            reconnect_delay: RECONNECT_DELAY,
        };

        let (sink, queue) = dispatch::queue();
        let (manager, reconnector) =
            ConnectionManager::new(config, Arc::new(broker.clone()), sink);
        let dispatcher = Dispatcher::new(ProcessRunner::new(script));

        let tasks = vec![
            tokio::spawn(reconnector.run()),
            tokio::spawn(async move { dispatcher.run(queue).await }),
        ];

        Self {
            broker,
            manager,
            output,
            _dir: dir,
            tasks,
        }
    }

    /// Lines written by the command so far.
    pub fn recorded(&self) -> Vec<String> {
        match std::fs::read_to_string(&self.output) {
            Ok(contents) => contents.lines().map(str::to_string).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Wait until the command has recorded `count` lines.
    pub async fn wait_for_lines(&self, count: usize) -> Vec<String> {
        wait_until(|| self.recorded().len() >= count).await;
        self.recorded()
    }

    /// Wait until the broker has handed out `count` sessions.
    pub async fn wait_for_sessions(&self, count: usize) {
        wait_until(|| self.broker.session_count() >= count).await;
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Poll `condition` every 10ms; panics after 5s.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
