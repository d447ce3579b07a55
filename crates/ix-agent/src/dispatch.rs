//! Message dispatch.
//!
//! The broker session pushes inbound messages into an unbounded queue from
//! its I/O task; a single consumer pulls them in arrival order and runs the
//! external command for each one, waiting for it to finish before taking
//! the next.

use tokio::sync::mpsc;

use ix_mqtt_channel::InboundMessage;

use crate::command::CommandRunner;

/// Create a connected producer/consumer pair.
pub fn queue() -> (MessageSink, MessageQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MessageSink { tx }, MessageQueue { rx })
}

/// Producer side. Never blocks.
#[derive(Debug, Clone)]
pub struct MessageSink {
    tx: mpsc::UnboundedSender<InboundMessage>,
}

impl MessageSink {
    /// Enqueue a message. Returns `false` once the consumer is gone.
    pub fn push(&self, message: InboundMessage) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// Consumer side.
#[derive(Debug)]
pub struct MessageQueue {
    rx: mpsc::UnboundedReceiver<InboundMessage>,
}

impl MessageQueue {
    pub async fn next(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }

    /// Messages waiting to be dispatched.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Sequentially feeds queued messages to a [`CommandRunner`].
pub struct Dispatcher<R> {
    runner: R,
}

impl<R: CommandRunner> Dispatcher<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    /// Consume the queue until every sink is dropped.
    ///
    /// Failed invocations are logged and never stop the loop.
    pub async fn run(&self, mut queue: MessageQueue) {
        while let Some(message) = queue.next().await {
            self.dispatch(&message).await;
        }
        tracing::info!("dispatch queue closed");
    }

    /// Run the command for one message. Returns whether it succeeded.
    pub async fn dispatch(&self, message: &InboundMessage) -> bool {
        tracing::info!(
            topic = %message.topic,
            payload = %message.payload_text(),
            "dispatching payload"
        );

        match self.runner.run(&message.payload).await {
            Ok(()) => {
                tracing::debug!(topic = %message.topic, "command completed");
                true
            }
            Err(e) => {
                tracing::warn!(topic = %message.topic, error = %e, "command failed");
                false
            }
        }
    }
}
