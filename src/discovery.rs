//! Background loop that learns the target process's PID and identity.
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{
    constants::{DISCOVERY_RETRY_DELAY, IDENTITY_MAX_ATTEMPTS, STOP_CHECK_STEP},
    join_with_timeout,
    metrics::pid_alive,
    rpc::ControlPlaneClient,
    target::TargetMonitor,
};

/// Retry policy of the discovery loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoverySettings {
    /// Delay between attempts.
    pub retry_delay: Duration,
    /// Identity lookups made before giving up on identity.
    pub identity_max_attempts: u32,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            retry_delay: DISCOVERY_RETRY_DELAY,
            identity_max_attempts: IDENTITY_MAX_ATTEMPTS,
        }
    }
}

/// Handle to a running discovery thread.
///
/// The loop ends on its own once identity is complete or the control plane
/// stops running; [`DiscoveryLoop::stop`] ends it early.
pub struct DiscoveryLoop {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DiscoveryLoop {
    /// Spawns the loop. `control_plane_running` is polled before every attempt.
    pub fn spawn<F>(
        target: TargetMonitor,
        client: ControlPlaneClient,
        control_plane_running: F,
        settings: DiscoverySettings,
    ) -> Self
    where
        F: Fn() -> bool + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            run(&target, &client, &control_plane_running, settings, &stop_flag);
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Whether the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|handle| handle.is_finished())
    }

    /// Signals the loop and waits up to `timeout` for it to exit.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        self.stop.store(true, Ordering::SeqCst);

        let Some(handle) = self.handle.take() else {
            return true;
        };

        let joined = join_with_timeout(handle, timeout);
        if !joined {
            warn!("discovery loop did not exit within {timeout:?}");
        }
        joined
    }
}

impl Drop for DiscoveryLoop {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn run(
    target: &TargetMonitor,
    client: &ControlPlaneClient,
    control_plane_running: &dyn Fn() -> bool,
    settings: DiscoverySettings,
    stop: &AtomicBool,
) {
    info!("discovering target on control-plane port {}", client.port());

    let mut identity_attempts = 0u32;
    let mut identity_exhausted = false;

    loop {
        if stop.load(Ordering::SeqCst) {
            debug!("discovery loop stopped");
            return;
        }
        if !control_plane_running() {
            debug!("control plane no longer running, discovery ends");
            return;
        }

        if target.pid().is_none_or(|pid| !pid_alive(pid)) {
            discover_pid(target, client);
        }

        if identity_attempts < settings.identity_max_attempts {
            identity_attempts += 1;
            match client.fetch_self_info() {
                Ok(Some(identity)) => {
                    target.record_identity(&identity);
                }
                Ok(None) => debug!("target not logged in yet (attempt {identity_attempts})"),
                Err(err) => debug!("identity lookup attempt {identity_attempts} failed: {err}"),
            }
        } else if !identity_exhausted {
            identity_exhausted = true;
            warn!(
                "identity not discovered after {} attempts, continuing with pid only",
                settings.identity_max_attempts
            );
        }

        if target.snapshot().identity_complete() {
            info!("target identity discovered, discovery ends");
            return;
        }

        if !sleep_unless_stopped(settings.retry_delay, stop) {
            debug!("discovery loop stopped");
            return;
        }
    }
}

fn discover_pid(target: &TargetMonitor, client: &ControlPlaneClient) {
    match client.fetch_process_pid() {
        Ok(Some(pid)) if pid_alive(pid) => {
            if target.pid() != Some(pid) {
                info!("target pid is {pid}");
            }
            target.set_pid(Some(pid));
        }
        Ok(Some(pid)) => debug!("reported target pid {pid} is not running"),
        Ok(None) => debug!("control plane has no target pid yet"),
        Err(err) => debug!("pid lookup failed: {err}"),
    }
}

/// Sleeps in short steps. Returns `false` if `stop` was raised meanwhile.
pub(crate) fn sleep_unless_stopped(duration: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(STOP_CHECK_STEP));
    }
}
