//! Periodic driver feeding log and resource updates to an observer.
//!
//! Two threads: one drains the log handoff queue on a short cadence, the
//! other refreshes the target snapshot. A slow RPC in the second never delays
//! log delivery.
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use tracing::debug;

use crate::{
    config::SupervisorSettings,
    discovery::sleep_unless_stopped,
    join_with_timeout,
    logs::{LogEntry, LogPipeline},
    target::{TargetMonitor, TargetProcessInfo},
};

/// Receives updates from [`MonitorDriver`]. Called from the driver threads.
pub trait MonitorObserver: Send + Sync {
    /// New log entries since the previous call. Never called with an empty slice.
    fn on_logs(&self, _entries: &[LogEntry]) {}

    /// Target snapshot after a refresh.
    fn on_target(&self, _info: &TargetProcessInfo) {}
}

/// Cadences of the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorIntervals {
    /// How often pending log entries are delivered.
    pub log_drain: Duration,
    /// How often the target is refreshed.
    pub sample: Duration,
}

impl From<&SupervisorSettings> for MonitorIntervals {
    fn from(settings: &SupervisorSettings) -> Self {
        Self {
            log_drain: settings.log_drain_interval,
            sample: settings.sample_interval,
        }
    }
}

/// Handle to the driver threads. Dropping it stops them.
pub struct MonitorDriver {
    stop: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl MonitorDriver {
    /// Starts the log drain and target refresh threads.
    pub fn spawn(
        logs: LogPipeline,
        target: TargetMonitor,
        observer: Arc<dyn MonitorObserver>,
        intervals: MonitorIntervals,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));

        let drain_stop = Arc::clone(&stop);
        let drain_observer = Arc::clone(&observer);
        let drain = thread::spawn(move || {
            loop {
                deliver_logs(&logs, drain_observer.as_ref());
                if !sleep_unless_stopped(intervals.log_drain, &drain_stop) {
                    deliver_logs(&logs, drain_observer.as_ref());
                    return;
                }
            }
        });

        let sample_stop = Arc::clone(&stop);
        let sample = thread::spawn(move || {
            loop {
                target.refresh();
                observer.on_target(&target.snapshot());
                if !sleep_unless_stopped(intervals.sample, &sample_stop) {
                    return;
                }
            }
        });

        Self {
            stop,
            handles: vec![drain, sample],
        }
    }

    /// Signals both threads and waits up to `timeout` for each.
    pub fn stop(mut self, timeout: Duration) -> bool {
        self.shutdown(timeout)
    }

    fn shutdown(&mut self, timeout: Duration) -> bool {
        self.stop.store(true, Ordering::SeqCst);
        let mut clean = true;
        for handle in self.handles.drain(..) {
            clean &= join_with_timeout(handle, timeout);
        }
        if !clean {
            debug!("monitor driver left a thread running");
        }
        clean
    }
}

impl Drop for MonitorDriver {
    fn drop(&mut self) {
        self.shutdown(crate::constants::THREAD_JOIN_TIMEOUT);
    }
}

fn deliver_logs(logs: &LogPipeline, observer: &dyn MonitorObserver) {
    let entries = logs.drain_pending();
    if !entries.is_empty() {
        observer.on_logs(&entries);
    }
}
