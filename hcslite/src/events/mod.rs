//! Lifecycle event publishing.
//!
//! Every state transition the manager cares about is serialised into a
//! typed [`Envelope`] and handed over either through a caller-supplied
//! sink (when the manager keeps a stream open to the shim) or by spawning
//! the manager's publish binary with the encoded envelope on stdin.
//!
//! Publication is serialised by one mutex so the manager observes topics
//! in emission order. A failed publish never rolls back the state
//! transition that produced it; the error is logged and dropped.

use async_trait::async_trait;
use chrono::Utc;
use hcslite_shared::{time, Envelope, HcsliteError, HcsliteResult};
use prost::Message;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::warn;

/// Topics emitted by the shim.
pub mod topics {
    pub const TASK_CREATE: &str = "/tasks/create";
    pub const TASK_START: &str = "/tasks/start";
    pub const TASK_EXEC_ADDED: &str = "/tasks/exec-added";
    pub const TASK_EXEC_STARTED: &str = "/tasks/exec-started";
    pub const TASK_EXIT: &str = "/tasks/exit";
    pub const TASK_DELETE: &str = "/tasks/delete";
    pub const TASK_OOM: &str = "/tasks/oom";
    pub const TASK_PAUSED: &str = "/tasks/paused";
    pub const TASK_RESUMED: &str = "/tasks/resumed";
}

/// A publishable lifecycle event: a protobuf message with a fixed topic
/// and URL-style type name.
pub trait Event: Message {
    const TOPIC: &'static str;
    const TYPE_URL: &'static str;
}

macro_rules! impl_event {
    ($message:ident, $topic:expr) => {
        impl Event for hcslite_shared::$message {
            const TOPIC: &'static str = $topic;
            const TYPE_URL: &'static str =
                concat!("types.hcslite.io/hcslite.v1.", stringify!($message));
        }
    };
}

impl_event!(TaskCreate, topics::TASK_CREATE);
impl_event!(TaskStart, topics::TASK_START);
impl_event!(TaskExecAdded, topics::TASK_EXEC_ADDED);
impl_event!(TaskExecStarted, topics::TASK_EXEC_STARTED);
impl_event!(TaskExit, topics::TASK_EXIT);
impl_event!(TaskDelete, topics::TASK_DELETE);
impl_event!(TaskOom, topics::TASK_OOM);
impl_event!(TaskPaused, topics::TASK_PAUSED);
impl_event!(TaskResumed, topics::TASK_RESUMED);

/// Delivery target for envelopes when the manager supplies a live stream.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn forward(&mut self, envelope: Envelope) -> HcsliteResult<()>;
}

enum Mode {
    /// Spawn the manager's publish binary per event.
    Binary { binary: PathBuf, address: String },
    /// Forward over a caller-supplied sink.
    Sink(Box<dyn EventSink>),
    /// Swallow events (delete subcommand, tests).
    Discard,
}

/// Serialised, topic-ordered event publisher. One per shim process.
pub struct EventPublisher {
    namespace: String,
    mode: Mutex<Mode>,
}

impl EventPublisher {
    pub fn with_binary(
        namespace: impl Into<String>,
        binary: impl Into<PathBuf>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            mode: Mutex::new(Mode::Binary {
                binary: binary.into(),
                address: address.into(),
            }),
        }
    }

    pub fn with_sink(namespace: impl Into<String>, sink: Box<dyn EventSink>) -> Self {
        Self {
            namespace: namespace.into(),
            mode: Mutex::new(Mode::Sink(sink)),
        }
    }

    pub fn discard(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            mode: Mutex::new(Mode::Discard),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Publish one event. Holds the publisher lock for the whole delivery
    /// so emission order is preserved end to end.
    pub async fn publish<E: Event>(&self, event: &E) {
        let envelope = Envelope {
            timestamp: Some(time::to_proto(Utc::now())),
            namespace: self.namespace.clone(),
            topic: E::TOPIC.to_string(),
            event: Some(prost_types::Any {
                type_url: E::TYPE_URL.to_string(),
                value: event.encode_to_vec(),
            }),
        };

        let mut mode = self.mode.lock().await;
        if let Err(err) = deliver(&mut mode, envelope).await {
            warn!(topic = E::TOPIC, error = %err, "failed to publish event");
        }
    }
}

async fn deliver(mode: &mut Mode, envelope: Envelope) -> HcsliteResult<()> {
    match mode {
        Mode::Discard => Ok(()),
        Mode::Sink(sink) => sink.forward(envelope).await,
        Mode::Binary { binary, address } => {
            let mut child = Command::new(&*binary)
                .arg("publish")
                .arg("--topic")
                .arg(&envelope.topic)
                .arg("--namespace")
                .arg(&envelope.namespace)
                .arg("--address")
                .arg(&*address)
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()?;

            let mut stdin = child.stdin.take().ok_or_else(|| {
                HcsliteError::Internal("publish binary has no stdin".into())
            })?;
            stdin.write_all(&envelope.encode_to_vec()).await?;
            drop(stdin);

            let status = child.wait().await?;
            if !status.success() {
                return Err(HcsliteError::Internal(format!(
                    "publish binary exited with {status}"
                )));
            }
            Ok(())
        }
    }
}
