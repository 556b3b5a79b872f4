//! Per-process resource sampling and PID helpers built on `sysinfo`.
use std::{
    thread,
    time::{Duration, Instant},
};

use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, Signal, System};
use tracing::{debug, warn};

use crate::constants::{BYTES_PER_MB, CPU_SAMPLE_WINDOW, EXIT_POLL_INTERVAL};

/// CPU and memory usage of a single process at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub struct ResourceSample {
    /// CPU usage in percent; may exceed 100 on multi-core machines.
    pub cpu_percent: f32,
    /// Resident memory in MiB.
    pub memory_mb: f64,
    /// Whether the process existed when sampled.
    pub alive: bool,
}

/// Samples one process at a time and keeps the `sysinfo` handle between calls.
///
/// CPU usage is a delta between two refreshes, so the first sample after the
/// PID changes takes a short measurement window.
pub struct ResourceSampler {
    system: System,
    cached_pid: Option<Pid>,
    window: Duration,
}

impl ResourceSampler {
    /// Creates a sampler using the default CPU measurement window.
    pub fn new() -> Self {
        Self::with_window(CPU_SAMPLE_WINDOW)
    }

    /// Creates a sampler with an explicit CPU measurement window.
    pub fn with_window(window: Duration) -> Self {
        Self {
            system: System::new(),
            cached_pid: None,
            window,
        }
    }

    /// PID the sampler currently holds a baseline for.
    pub fn cached_pid(&self) -> Option<u32> {
        self.cached_pid.map(|pid| pid.as_u32())
    }

    /// Drops the cached handle so the next sample starts a fresh baseline.
    pub fn invalidate(&mut self) {
        self.cached_pid = None;
        self.system = System::new();
    }

    /// Measures `pid`. A process that is gone or a zombie yields zeroes and `alive == false`.
    pub fn sample(&mut self, pid: u32) -> ResourceSample {
        let target = Pid::from_u32(pid);

        if self.cached_pid != Some(target) {
            self.invalidate();
            refresh_one(&mut self.system, target);
            self.cached_pid = Some(target);
            thread::sleep(self.window);
        }

        refresh_one(&mut self.system, target);

        match self.system.process(target) {
            Some(process) if process.status() != ProcessStatus::Zombie => ResourceSample {
                cpu_percent: process.cpu_usage(),
                memory_mb: process.memory() as f64 / BYTES_PER_MB,
                alive: true,
            },
            _ => {
                debug!("pid {pid} vanished while sampling");
                self.invalidate();
                ResourceSample::default()
            }
        }
    }
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

fn refresh_one(system: &mut System, pid: Pid) {
    let processes = [pid];
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&processes),
        true,
        ProcessRefreshKind::everything(),
    );
}

/// Returns `true` when `pid` refers to a running, non-zombie process.
pub fn pid_alive(pid: u32) -> bool {
    let target = Pid::from_u32(pid);
    let mut system = System::new();
    refresh_one(&mut system, target);

    system
        .process(target)
        .is_some_and(|process| process.status() != ProcessStatus::Zombie)
}

/// Finds a running process whose name contains `fragment`, ignoring case.
///
/// When several processes match, the lowest PID wins and the ambiguity is logged.
pub fn find_pid_by_name(fragment: &str) -> Option<u32> {
    let needle = fragment.to_lowercase();
    if needle.is_empty() {
        return None;
    }

    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mut matches: Vec<u32> = system
        .processes()
        .iter()
        .filter(|(_, process)| process.status() != ProcessStatus::Zombie)
        .filter(|(_, process)| {
            process
                .name()
                .to_string_lossy()
                .to_lowercase()
                .contains(&needle)
        })
        .map(|(pid, _)| pid.as_u32())
        .collect();
    matches.sort_unstable();

    if matches.len() > 1 {
        warn!(
            "{} processes match '{fragment}', using lowest pid {}",
            matches.len(),
            matches[0]
        );
    }

    matches.first().copied()
}

/// Terminates a process that is not our child.
///
/// Sends a termination request and waits up to `graceful`, then kills and
/// waits up to `forceful`. Returns `true` once the PID is gone.
pub fn terminate_pid(pid: u32, graceful: Duration, forceful: Duration) -> bool {
    let target = Pid::from_u32(pid);
    let mut system = System::new();
    refresh_one(&mut system, target);

    let Some(process) = system.process(target) else {
        return true;
    };

    if process.kill_with(Signal::Term).is_none() {
        debug!("graceful termination unsupported, killing pid {pid}");
        process.kill();
    }
    if wait_for_exit(pid, graceful) {
        return true;
    }

    warn!("pid {pid} ignored termination, killing");
    if let Some(process) = system.process(target) {
        process.kill();
    }
    wait_for_exit(pid, forceful)
}

fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !pid_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }
}
