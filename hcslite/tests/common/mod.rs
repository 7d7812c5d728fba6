//! Shared fixtures for the service-level tests.

#![allow(dead_code)]

use async_trait::async_trait;
use hcslite::events::{EventPublisher, EventSink};
use hcslite::{Config, TaskService};
use hcslite_shared::{Envelope, HcsliteResult};
use hcslite_test_utils::bundle::{self, BundleOs};
use hcslite_test_utils::{MockBackend, MockController};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const NAMESPACE: &str = "k8s-test";

/// Captures published envelopes for assertions.
pub struct CaptureSink {
    seen: Arc<Mutex<Vec<Envelope>>>,
}

#[async_trait]
impl EventSink for CaptureSink {
    async fn forward(&mut self, envelope: Envelope) -> HcsliteResult<()> {
        self.seen.lock().push(envelope);
        Ok(())
    }
}

/// Test context: one service over a mock backend, with an isolated bundle.
pub struct Fixture {
    pub service: Arc<TaskService>,
    pub controller: MockController,
    pub events: Arc<Mutex<Vec<Envelope>>>,
    pub task_id: String,
    pub bundle: TempDir,
}

impl Fixture {
    pub fn bundle_path(&self) -> String {
        self.bundle.path().display().to_string()
    }

    /// Topics seen so far, in emission order.
    pub fn topics(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.topic.clone()).collect()
    }
}

/// Short timeouts so failure paths do not stall the suite.
pub fn test_config() -> Config {
    Config {
        system_create_timeout: Duration::from_secs(5),
        system_start_timeout: Duration::from_secs(5),
        process_create_timeout: Duration::from_secs(5),
        signal_timeout: Duration::from_secs(5),
        io_dial_timeout: Duration::from_secs(2),
        io_drain_grace: Duration::from_millis(500),
    }
}

pub fn fixture_with(task_id: &str, os: BundleOs, annotations: &[(&str, &str)]) -> Fixture {
    let bundle_dir = TempDir::new().expect("create bundle dir");
    bundle::write_config(bundle_dir.path(), os, annotations);

    let (backend, controller) = MockBackend::new();
    let events = Arc::new(Mutex::new(Vec::new()));
    let publisher = Arc::new(EventPublisher::with_sink(
        NAMESPACE,
        Box::new(CaptureSink {
            seen: Arc::clone(&events),
        }),
    ));

    let service = TaskService::new(task_id, NAMESPACE, backend, publisher, test_config())
        .expect("build service");

    Fixture {
        service,
        controller,
        events,
        task_id: task_id.to_string(),
        bundle: bundle_dir,
    }
}

/// A plain Windows container task.
pub fn fixture(task_id: &str) -> Fixture {
    fixture_with(task_id, BundleOs::Windows, &[])
}

/// A pod sandbox task.
pub fn sandbox_fixture(task_id: &str) -> Fixture {
    fixture_with(
        task_id,
        BundleOs::Linux,
        &[("io.kubernetes.cri.container-type", "podsandbox")],
    )
}

/// JSON-encoded OCI process spec for Exec requests.
pub fn process_spec() -> prost_types::Any {
    let spec = serde_json::json!({
        "terminal": false,
        "user": { "uid": 0, "gid": 0 },
        "args": ["worker", "--once"],
        "env": ["MODE=test"],
        "cwd": "/",
    });
    prost_types::Any {
        type_url: "types.hcslite.io/opencontainers/runtime-spec/1/Process".into(),
        value: serde_json::to_vec(&spec).unwrap(),
    }
}

/// Await a future with the suite-wide deadline.
pub async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("operation timed out")
}
