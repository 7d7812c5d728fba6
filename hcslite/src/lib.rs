//! hcslite - task/exec lifecycle shim for HCS-backed containers
//!
//! One shim process serves one task (a container or a pod sandbox): it
//! exposes the manager-facing task RPC surface, relays stdio between
//! manager-chosen endpoints and the compute backend, converts backend
//! callbacks into lifecycle transitions, and publishes lifecycle events
//! back to the manager.
//!
//! The compute backend itself is behind the traits in [`compute`]; the
//! Windows HCS client lives in `compute::hcs`, and tests run against the
//! mock backend from `hcslite-test-utils`.

pub mod bootstrap;
pub mod compute;
pub mod config;
pub mod events;
pub mod exec;
pub mod latch;
pub mod notify;
pub mod relay;
pub mod service;
pub mod task;

pub use config::Config;
pub use latch::{ExitLatch, ExitStatus};
pub use service::TaskService;
pub use task::{Task, TaskKind};
