//! Diagnostic stack-dump trigger.
//!
//! A long-lived shim occasionally wedges in the field; operators need a
//! way to ask "what are you doing" without a debugger. On Windows the
//! trigger is a named event (settable with any tooling that can open
//! events); elsewhere it is SIGUSR1.

use tracing::warn;

/// Register the process-wide dump trigger. Never fails; diagnostics are
/// best-effort.
pub fn register_stackdump_trigger() {
    #[cfg(unix)]
    {
        tokio::spawn(async {
            let mut signal = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::user_defined1(),
            ) {
                Ok(signal) => signal,
                Err(err) => {
                    warn!(error = %err, "failed to install stack-dump signal handler");
                    return;
                }
            };
            while signal.recv().await.is_some() {
                dump_state();
            }
        });
    }

    #[cfg(windows)]
    {
        use hcslite_shared::constants::env as env_vars;

        let name = std::env::var(env_vars::STACKDUMP_EVENT)
            .unwrap_or_else(|_| format!("Global\\hcslite-stackdump-{}", std::process::id()));
        let handle = tokio::runtime::Handle::current();

        std::thread::spawn(move || {
            use std::os::windows::ffi::OsStrExt;
            use windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE;
            use windows_sys::Win32::System::Threading::{CreateEventW, WaitForSingleObject, INFINITE};

            let wide: Vec<u16> = std::ffi::OsStr::new(&name)
                .encode_wide()
                .chain(std::iter::once(0))
                .collect();
            // Manual-reset = FALSE so each SetEvent produces one dump.
            let event = unsafe { CreateEventW(std::ptr::null(), 0, 0, wide.as_ptr()) };
            if event.is_null() || event == INVALID_HANDLE_VALUE {
                warn!(event = %name, "failed to create stack-dump event");
                return;
            }
            loop {
                unsafe { WaitForSingleObject(event, INFINITE) };
                let _guard = handle.enter();
                dump_state();
            }
        });
    }
}

fn dump_state() {
    let handle = match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => {
            warn!("stack dump requested outside the runtime");
            return;
        }
    };
    let metrics = handle.metrics();
    warn!(
        workers = metrics.num_workers(),
        alive_tasks = metrics.num_alive_tasks(),
        "stack dump requested"
    );
}
