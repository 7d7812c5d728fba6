//! Shim runtime tunables.

use hcslite_shared::constants::timeouts;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timeouts applied at the call sites of compute-backend operations and the
/// stdio relay. Every value can be overridden by the embedder; the defaults
/// come from `hcslite_shared::constants::timeouts`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Creating a compute system (may bring a utility VM up).
    pub system_create_timeout: Duration,

    /// Starting a created compute system.
    pub system_start_timeout: Duration,

    /// Creating a process inside a running system.
    pub process_create_timeout: Duration,

    /// Delivering a signal or termination request.
    pub signal_timeout: Duration,

    /// Dialling a caller-supplied stdio endpoint.
    pub io_dial_timeout: Duration,

    /// Grace window for stdio pumps to drain after process exit. When
    /// exceeded, the backend handles are force-closed to unblock readers.
    pub io_drain_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            system_create_timeout: timeouts::SYSTEM_CREATE,
            system_start_timeout: timeouts::SYSTEM_START,
            process_create_timeout: timeouts::PROCESS_CREATE,
            signal_timeout: timeouts::SIGNAL,
            io_dial_timeout: timeouts::IO_DIAL,
            io_drain_grace: timeouts::IO_DRAIN_GRACE,
        }
    }
}
