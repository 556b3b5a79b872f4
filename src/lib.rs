//! Lillia supervises a QQ protocol bridge (the control plane), the bot runtime
//! that talks to it, and keeps track of the QQ client the bridge launches. It
//! captures the output of every child it spawns, detects crashes, and samples
//! the client's CPU and memory once its PID is learned over the bridge's RPC.

use std::{
    sync::{Mutex, MutexGuard},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Tuning constants.
pub mod constants;

/// PID and identity discovery.
pub mod discovery;

/// Error handling.
pub mod error;

/// Log capture pipeline.
pub mod logs;

/// Resource sampling.
pub mod metrics;

/// Periodic log/resource driver.
pub mod monitor;

/// Port allocation.
pub mod port;

/// Elevated launching.
pub mod privilege;

/// Control-plane RPC client.
pub mod rpc;

/// Managed process supervisor.
pub mod supervisor;

/// Target process state.
pub mod target;

#[doc(hidden)]
pub mod test_utils;

/// Locks `mutex`, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Joins `handle` if it finishes within `timeout`; otherwise leaves it running.
pub(crate) fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(constants::STOP_CHECK_STEP / 2);
    }
    let _ = handle.join();
    true
}
