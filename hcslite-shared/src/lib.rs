//! hcslite shared types - protocol, errors, and transport
//!
//! This crate contains the protobuf task-service definitions plus the
//! common types used by both the shim runtime and the bootstrap client.

pub mod constants;
pub mod errors;
pub mod time;
pub mod transport;

// Generated protobuf types
pub mod generated {
    #![allow(clippy::all, unused_qualifications)]
    tonic::include_proto!("hcslite.v1");
}

pub use errors::{HcsliteError, HcsliteResult};
pub use transport::Transport;

// Task service
pub use generated::task_client::TaskClient;
pub use generated::task_server::{Task, TaskServer};

// All generated types
pub use generated::*;
