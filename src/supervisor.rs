//! Lifecycle of the managed processes: start, stop, watchdog and shutdown.
use std::{
    collections::HashMap,
    env, io,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use serde::Serialize;
use strum_macros::{AsRefStr, Display};
use tracing::{debug, error, info, warn};

use crate::{
    config::SupervisorSettings,
    constants::{
        BOT_RUNTIME_NAME, CONTROL_PLANE_NAME, DEFAULT_CONTROL_PLANE_PORT, DEFAULT_PORT_ATTEMPTS,
        EARLY_EXIT_OUTPUT_TIMEOUT, ELEVATED_PID_SCAN_ATTEMPTS, ELEVATED_PID_SCAN_INTERVAL,
        EXIT_POLL_INTERVAL, STOP_CHECK_STEP, THREAD_JOIN_TIMEOUT, WAIT_STOPPED_POLL,
    },
    discovery::DiscoveryLoop,
    error::ProcessManagerError,
    join_with_timeout, lock,
    logs::LogPipeline,
    metrics::{find_pid_by_name, pid_alive, terminate_pid},
    port::find_available_port,
    privilege::{Elevation, SystemElevation},
    rpc::ControlPlaneClient,
    target::{Identity, TargetMonitor},
};

/// Lifecycle state of a managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, AsRefStr, Display)]
pub enum ProcessStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

/// How a running process was launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, AsRefStr, Display)]
pub enum LaunchMode {
    /// Spawned as our child with captured pipes.
    Direct,
    /// Handed to the elevation facility; not our child.
    Elevated,
}

/// Executable, arguments and working directory of one launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl LaunchSpec {
    /// Launch of `executable` without arguments.
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    /// Replaces the argument list.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Control-plane launch. The port flag is generated from an allocated port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPlaneLaunch {
    pub name: String,
    pub executable: PathBuf,
    /// Target client binary, `--qq-path=` when non-empty.
    pub qq_path: String,
    /// Account to log in automatically, `--qq=` when non-empty.
    pub auto_login: String,
    /// Adds `--headless`.
    pub headless: bool,
    pub base_port: u16,
    pub port_attempts: u32,
    pub extra_args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl ControlPlaneLaunch {
    /// Control-plane launch with default name and port range.
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            name: CONTROL_PLANE_NAME.to_string(),
            executable: executable.into(),
            qq_path: String::new(),
            auto_login: String::new(),
            headless: false,
            base_port: DEFAULT_CONTROL_PLANE_PORT,
            port_attempts: DEFAULT_PORT_ATTEMPTS,
            extra_args: Vec::new(),
            working_dir: None,
        }
    }

    /// Arguments for a launch bound to `port`.
    pub fn args_for_port(&self, port: u16) -> Vec<String> {
        let mut args = vec![format!("--port={port}")];
        if !self.qq_path.is_empty() {
            args.push(format!("--qq-path={}", self.qq_path));
        }
        if !self.auto_login.is_empty() {
            args.push(format!("--qq={}", self.auto_login));
        }
        if self.headless {
            args.push("--headless".to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Bot runtime launch: `node script --pmhq-port=N ...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotRuntimeLaunch {
    pub name: String,
    pub node: PathBuf,
    pub script: PathBuf,
    pub extra_args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl BotRuntimeLaunch {
    /// Bot runtime launch with the default name.
    pub fn new(node: impl Into<PathBuf>, script: impl Into<PathBuf>) -> Self {
        Self {
            name: BOT_RUNTIME_NAME.to_string(),
            node: node.into(),
            script: script.into(),
            extra_args: Vec::new(),
            working_dir: None,
        }
    }
}

enum ProcessHandle {
    Direct(Child),
    Elevated {
        pid: Option<u32>,
        name_hint: String,
    },
}

impl ProcessHandle {
    fn pid(&self) -> Option<u32> {
        match self {
            ProcessHandle::Direct(child) => Some(child.id()),
            ProcessHandle::Elevated { pid, .. } => *pid,
        }
    }
}

struct ManagedProcess {
    status: ProcessStatus,
    handle: Option<ProcessHandle>,
    launch_mode: Option<LaunchMode>,
    /// Bumped by every start and by `stop`; an in-flight start commits only
    /// while it still owns the current attempt.
    attempt: u64,
}

impl Default for ManagedProcess {
    fn default() -> Self {
        Self {
            status: ProcessStatus::Stopped,
            handle: None,
            launch_mode: None,
            attempt: 0,
        }
    }
}

impl ManagedProcess {
    fn owned_by(&self, attempt: u64) -> bool {
        self.status == ProcessStatus::Starting && self.attempt == attempt
    }
}

enum StartOutcome {
    Started,
    AlreadyRunning,
    Failed,
}

/// Owns the managed processes and every background loop attached to them.
pub struct Supervisor {
    /// Status and OS handle per process name.
    processes: Arc<Mutex<HashMap<String, ManagedProcess>>>,
    logs: LogPipeline,
    target: TargetMonitor,
    settings: SupervisorSettings,
    elevation: Arc<dyn Elevation>,
    /// Whether the watchdog should keep running.
    running: Arc<AtomicBool>,
    watchdog_handle: Mutex<Option<thread::JoinHandle<()>>>,
    discovery: Mutex<Option<DiscoveryLoop>>,
    /// Name and port of the control plane started by this supervisor.
    control_plane: Mutex<Option<(String, u16)>>,
}

impl Supervisor {
    /// Creates a supervisor using the host elevation facility.
    pub fn new(settings: SupervisorSettings) -> Self {
        Self::with_elevation(settings, Box::new(SystemElevation))
    }

    /// Creates a supervisor with an explicit elevation facility.
    pub fn with_elevation(settings: SupervisorSettings, elevation: Box<dyn Elevation>) -> Self {
        debug!("Initializing supervisor...");

        let mut processes = HashMap::new();
        for name in [CONTROL_PLANE_NAME, BOT_RUNTIME_NAME] {
            processes.insert(name.to_string(), ManagedProcess::default());
        }

        Self {
            processes: Arc::new(Mutex::new(processes)),
            logs: LogPipeline::new(settings.log_capacity),
            target: TargetMonitor::new(),
            settings,
            elevation: Arc::from(elevation),
            running: Arc::new(AtomicBool::new(false)),
            watchdog_handle: Mutex::new(None),
            discovery: Mutex::new(None),
            control_plane: Mutex::new(None),
        }
    }

    /// Shared log pipeline.
    pub fn logs(&self) -> LogPipeline {
        self.logs.clone()
    }

    /// Shared target process state.
    pub fn target(&self) -> TargetMonitor {
        self.target.clone()
    }

    /// Settings in effect.
    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Registers the callback fired when the target's account id changes.
    pub fn set_identity_callback<F>(&self, callback: F)
    where
        F: Fn(&Identity) + Send + Sync + 'static,
    {
        self.target.set_identity_callback(callback);
    }

    /// Status of `name`; unknown names are `Stopped`.
    pub fn get_status(&self, name: &str) -> ProcessStatus {
        lock(&self.processes)
            .get(name)
            .map(|entry| entry.status)
            .unwrap_or(ProcessStatus::Stopped)
    }

    /// Status of every known process, sorted by name.
    pub fn statuses(&self) -> Vec<(String, ProcessStatus)> {
        let mut statuses: Vec<(String, ProcessStatus)> = lock(&self.processes)
            .iter()
            .map(|(name, entry)| (name.clone(), entry.status))
            .collect();
        statuses.sort_by(|a, b| a.0.cmp(&b.0));
        statuses
    }

    /// PID of `name` while it has a handle.
    pub fn get_pid(&self, name: &str) -> Option<u32> {
        lock(&self.processes)
            .get(name)
            .and_then(|entry| entry.handle.as_ref())
            .and_then(ProcessHandle::pid)
    }

    /// How `name` was launched, while it has a handle.
    pub fn launch_mode(&self, name: &str) -> Option<LaunchMode> {
        lock(&self.processes)
            .get(name)
            .and_then(|entry| entry.launch_mode)
    }

    /// Port allocated to the control plane started by this supervisor.
    pub fn control_plane_port(&self) -> Option<u16> {
        lock(&self.control_plane).as_ref().map(|(_, port)| *port)
    }

    /// Starts `name`. Returns `true` if it is running afterwards.
    pub fn start(&self, name: &str, spec: &LaunchSpec) -> bool {
        !matches!(self.start_process(name, spec), StartOutcome::Failed)
    }

    /// Allocates a port, starts the control plane with it and begins discovery.
    pub fn start_control_plane(&self, launch: &ControlPlaneLaunch) -> bool {
        if self.get_status(&launch.name) == ProcessStatus::Running {
            debug!("Process '{}' is already running", launch.name);
            return true;
        }

        let port = match find_available_port(launch.base_port, launch.port_attempts) {
            Ok(port) => port,
            Err(err) => {
                let err = ProcessManagerError::from(err);
                error!("Cannot start '{}': {err}", launch.name);
                self.fail_idle(&launch.name);
                return false;
            }
        };

        let spec = LaunchSpec {
            executable: launch.executable.clone(),
            args: launch.args_for_port(port),
            working_dir: launch.working_dir.clone(),
        };

        match self.start_process(&launch.name, &spec) {
            StartOutcome::Started => {
                info!("Control plane '{}' listening on port {port}", launch.name);
                *lock(&self.control_plane) = Some((launch.name.clone(), port));
                self.start_discovery(&launch.name, port);
                true
            }
            StartOutcome::AlreadyRunning => true,
            StartOutcome::Failed => false,
        }
    }

    /// Starts the bot runtime, pointing it at the control-plane port when known.
    pub fn start_bot_runtime(&self, launch: &BotRuntimeLaunch) -> bool {
        if !launch.script.exists() {
            error!(
                "Script for '{}' not found at {}",
                launch.name,
                launch.script.display()
            );
            self.fail_idle(&launch.name);
            return false;
        }

        let mut args = vec![launch.script.to_string_lossy().to_string()];
        match self.control_plane_port() {
            Some(port) => args.push(format!("--pmhq-port={port}")),
            None => warn!(
                "Starting '{}' without a control-plane port",
                launch.name
            ),
        }
        args.extend(launch.extra_args.iter().cloned());

        let spec = LaunchSpec {
            executable: launch.node.clone(),
            args,
            working_dir: launch.working_dir.clone(),
        };
        self.start(&launch.name, &spec)
    }

    fn start_process(&self, name: &str, spec: &LaunchSpec) -> StartOutcome {
        let attempt = {
            let mut processes = lock(&self.processes);
            let entry = processes.entry(name.to_string()).or_default();
            match entry.status {
                ProcessStatus::Running => {
                    debug!("Process '{name}' is already running");
                    return StartOutcome::AlreadyRunning;
                }
                ProcessStatus::Starting | ProcessStatus::Stopping => {
                    warn!("Process '{name}' is {}, start ignored", entry.status);
                    return StartOutcome::Failed;
                }
                ProcessStatus::Stopped | ProcessStatus::Error => {
                    entry.status = ProcessStatus::Starting;
                    entry.attempt += 1;
                    entry.attempt
                }
            }
        };

        let Some(executable) = locate_executable(&spec.executable) else {
            let err = ProcessManagerError::ExecutableMissing {
                process: name.to_string(),
                path: spec.executable.display().to_string(),
            };
            error!("{err}");
            self.fail_attempt(name, attempt);
            return StartOutcome::Failed;
        };

        info!("Starting process '{name}': {} {:?}", executable.display(), spec.args);

        let mut cmd = Command::new(&executable);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            cmd.creation_flags(crate::privilege::CREATE_NO_WINDOW);
        }

        match cmd.spawn() {
            Ok(child) => self.finish_direct_start(name, attempt, child),
            Err(err) if self.elevation.elevation_required(&err) => {
                self.start_elevated(name, attempt, &executable, spec, err)
            }
            Err(source) => {
                let err = ProcessManagerError::ProcessStartError {
                    process: name.to_string(),
                    source,
                };
                error!("{err}");
                self.fail_attempt(name, attempt);
                StartOutcome::Failed
            }
        }
    }

    fn finish_direct_start(&self, name: &str, attempt: u64, mut child: Child) -> StartOutcome {
        let pid = child.id();
        match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => self.logs.attach(name, stdout, stderr),
            (stdout, stderr) => {
                if let Some(stdout) = stdout {
                    self.logs
                        .attach_stream(name, stdout, crate::logs::StreamKind::Stdout);
                }
                if let Some(stderr) = stderr {
                    self.logs
                        .attach_stream(name, stderr, crate::logs::StreamKind::Stderr);
                }
            }
        }

        thread::sleep(self.settings.startup_grace);

        match child.try_wait() {
            Ok(Some(status)) => {
                self.logs.wait_readers(name, EARLY_EXIT_OUTPUT_TIMEOUT);
                let entries = self.logs.get_logs(Some(name));
                let tail: Vec<&str> = entries[entries.len().saturating_sub(5)..]
                    .iter()
                    .map(|entry| entry.text.as_str())
                    .collect();
                error!(
                    "Process '{name}' (PID {pid}) exited during startup with {status}; last output: {tail:?}"
                );
                self.fail_attempt(name, attempt);
                return StartOutcome::Failed;
            }
            Ok(None) => {}
            Err(err) => {
                error!("Failed to check startup of '{name}': {err}");
                let _ = child.kill();
                let _ = child.wait();
                self.fail_attempt(name, attempt);
                return StartOutcome::Failed;
            }
        }

        {
            let mut processes = lock(&self.processes);
            let entry = processes.entry(name.to_string()).or_default();
            if !entry.owned_by(attempt) {
                drop(processes);
                info!("Process '{name}' was stopped while starting");
                let _ = child.kill();
                let _ = wait_with_timeout(&mut child, self.settings.forceful_stop);
                return StartOutcome::Failed;
            }

            entry.status = ProcessStatus::Running;
            entry.handle = Some(ProcessHandle::Direct(child));
            entry.launch_mode = Some(LaunchMode::Direct);
        }

        info!("Process '{name}' running with PID {pid}");
        self.spawn_watchdog();
        StartOutcome::Started
    }

    fn start_elevated(
        &self,
        name: &str,
        attempt: u64,
        executable: &Path,
        spec: &LaunchSpec,
        spawn_error: io::Error,
    ) -> StartOutcome {
        if self.elevation.is_elevated() {
            error!("Process '{name}' requires elevation but supervisor is already elevated: {spawn_error}");
            self.fail_attempt(name, attempt);
            return StartOutcome::Failed;
        }

        warn!("Process '{name}' requires elevation, relaunching elevated");
        if let Err(source) =
            self.elevation
                .launch(executable, &spec.args, spec.working_dir.as_deref())
        {
            let err = ProcessManagerError::ProcessStartError {
                process: name.to_string(),
                source,
            };
            error!("{err}");
            self.fail_attempt(name, attempt);
            return StartOutcome::Failed;
        }

        let name_hint = executable
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut pid = None;
        for scan in 1..=ELEVATED_PID_SCAN_ATTEMPTS {
            pid = find_pid_by_name(&name_hint);
            if pid.is_some() {
                break;
            }
            if scan < ELEVATED_PID_SCAN_ATTEMPTS {
                thread::sleep(ELEVATED_PID_SCAN_INTERVAL);
            }
        }

        match pid {
            Some(pid) => info!("Elevated process '{name}' found with PID {pid}"),
            None => warn!(
                "PID of elevated process '{name}' not found; logs and resource data are unavailable"
            ),
        }

        {
            let mut processes = lock(&self.processes);
            let entry = processes.entry(name.to_string()).or_default();
            if !entry.owned_by(attempt) {
                drop(processes);
                info!("Process '{name}' was stopped while starting");
                if let Some(pid) = pid {
                    terminate_pid(pid, self.settings.graceful_stop, self.settings.forceful_stop);
                }
                return StartOutcome::Failed;
            }

            entry.status = ProcessStatus::Running;
            entry.handle = Some(ProcessHandle::Elevated { pid, name_hint });
            entry.launch_mode = Some(LaunchMode::Elevated);
        }

        self.spawn_watchdog();
        StartOutcome::Started
    }

    fn start_discovery(&self, name: &str, port: u16) {
        let client = match ControlPlaneClient::new(port, self.settings.rpc_timeout) {
            Ok(client) => client,
            Err(err) => {
                warn!("Discovery for '{name}' disabled: {err}");
                return;
            }
        };
        self.target.attach_client(client.clone());

        let processes = Arc::clone(&self.processes);
        let process_name = name.to_string();
        let control_plane_running = move || {
            lock(&processes)
                .get(&process_name)
                .is_some_and(|entry| entry.status == ProcessStatus::Running)
        };

        let discovery = DiscoveryLoop::spawn(
            self.target.clone(),
            client,
            control_plane_running,
            self.settings.discovery,
        );

        let previous = lock(&self.discovery).replace(discovery);
        if let Some(mut previous) = previous {
            previous.stop(THREAD_JOIN_TIMEOUT);
        }
    }

    fn stop_discovery(&self) {
        let discovery = lock(&self.discovery).take();
        if let Some(mut discovery) = discovery {
            discovery.stop(THREAD_JOIN_TIMEOUT);
        }
    }

    /// Stops `name` gracefully, then forcefully. Returns `false` only if the kill failed.
    pub fn stop(&self, name: &str) -> bool {
        let handle = {
            let mut processes = lock(&self.processes);
            let Some(entry) = processes.get_mut(name) else {
                debug!("Process '{name}' is unknown, nothing to stop");
                return true;
            };

            match entry.status {
                ProcessStatus::Running => {
                    entry.status = ProcessStatus::Stopping;
                    entry.handle.take()
                }
                ProcessStatus::Starting => {
                    debug!("Process '{name}' stopped while starting");
                    entry.status = ProcessStatus::Stopped;
                    entry.attempt += 1;
                    return true;
                }
                ProcessStatus::Stopping => {
                    debug!("Process '{name}' is already stopping");
                    return true;
                }
                ProcessStatus::Stopped | ProcessStatus::Error => {
                    entry.status = ProcessStatus::Stopped;
                    entry.handle = None;
                    entry.launch_mode = None;
                    return true;
                }
            }
        };

        info!("Stopping process '{name}'");
        self.logs.detach(name);

        let result = match handle {
            Some(ProcessHandle::Direct(child)) => self.stop_child(name, child),
            Some(ProcessHandle::Elevated { pid, name_hint }) => {
                self.stop_elevated(name, pid, &name_hint)
            }
            None => Ok(()),
        };

        let is_control_plane = lock(&self.control_plane)
            .as_ref()
            .is_some_and(|(control_plane, _)| control_plane == name);
        if is_control_plane {
            self.stop_discovery();
            self.target.detach_client();
            *lock(&self.control_plane) = None;
        }

        let stopped = match result {
            Ok(()) => {
                info!("Process '{name}' stopped");
                true
            }
            Err(err) => {
                error!("{err}");
                false
            }
        };

        let mut processes = lock(&self.processes);
        let entry = processes.entry(name.to_string()).or_default();
        entry.status = if stopped {
            ProcessStatus::Stopped
        } else {
            ProcessStatus::Error
        };
        entry.launch_mode = None;
        stopped
    }

    fn stop_child(&self, name: &str, mut child: Child) -> Result<(), ProcessManagerError> {
        if let Ok(Some(status)) = child.try_wait() {
            debug!("Process '{name}' had already exited with {status}");
            return Ok(());
        }

        request_termination(name, &mut child);

        match wait_with_timeout(&mut child, self.settings.graceful_stop) {
            Ok(Some(status)) => {
                debug!("Process '{name}' exited with {status}");
                return Ok(());
            }
            Ok(None) => {}
            Err(err) => debug!("Waiting on '{name}' failed: {err}"),
        }

        warn!(
            "Process '{name}' did not exit within {:?}; killing",
            self.settings.graceful_stop
        );
        if let Err(source) = child.kill()
            && !matches!(child.try_wait(), Ok(Some(_)))
        {
            return Err(ProcessManagerError::ProcessStopError {
                process: name.to_string(),
                source,
            });
        }

        match wait_with_timeout(&mut child, self.settings.forceful_stop) {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(ProcessManagerError::ProcessStopError {
                process: name.to_string(),
                source: io::Error::new(
                    io::ErrorKind::TimedOut,
                    "process survived a forceful kill",
                ),
            }),
            Err(source) => Err(ProcessManagerError::ProcessStopError {
                process: name.to_string(),
                source,
            }),
        }
    }

    fn stop_elevated(
        &self,
        name: &str,
        pid: Option<u32>,
        name_hint: &str,
    ) -> Result<(), ProcessManagerError> {
        let Some(pid) = pid.or_else(|| find_pid_by_name(name_hint)) else {
            warn!("Elevated process '{name}' has no known PID; it may still be running");
            return Ok(());
        };

        if terminate_pid(pid, self.settings.graceful_stop, self.settings.forceful_stop) {
            Ok(())
        } else {
            Err(ProcessManagerError::ProcessStopError {
                process: name.to_string(),
                source: io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("PID {pid} could not be terminated"),
                ),
            })
        }
    }

    /// Stops every active managed process, and the target process when asked.
    pub fn stop_all(&self, stop_target: bool) {
        let active: Vec<String> = lock(&self.processes)
            .iter()
            .filter(|(_, entry)| {
                matches!(
                    entry.status,
                    ProcessStatus::Running | ProcessStatus::Starting
                )
            })
            .map(|(name, _)| name.clone())
            .collect();

        if active.is_empty() && !stop_target {
            debug!("No managed process is running");
            return;
        }

        for name in active {
            self.stop(&name);
        }

        if stop_target && let Some(pid) = self.target.pid() {
            info!("Stopping target process (PID {pid})");
            if terminate_pid(pid, self.settings.graceful_stop, self.settings.forceful_stop) {
                self.target.set_pid(None);
            } else {
                warn!("Target process (PID {pid}) could not be terminated");
            }
        }
    }

    /// Polls until no managed process is running and the target PID is gone.
    pub fn wait_all_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            Self::check_liveness(&self.processes);

            let managed_stopped = lock(&self.processes)
                .values()
                .all(|entry| entry.status != ProcessStatus::Running);
            let target_stopped = self.target.pid().is_none_or(|pid| !pid_alive(pid));

            if managed_stopped && target_stopped {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(WAIT_STOPPED_POLL.min(deadline - now));
        }
    }

    /// Stops background loops and processes, then joins threads with bounded waits.
    pub fn shutdown(&self, stop_target: bool) {
        info!("Shutting down supervisor");
        self.running.store(false, Ordering::SeqCst);
        self.stop_discovery();
        self.stop_all(stop_target);

        let watchdog = lock(&self.watchdog_handle).take();
        if let Some(handle) = watchdog
            && !join_with_timeout(handle, THREAD_JOIN_TIMEOUT)
        {
            warn!("Watchdog did not exit within {THREAD_JOIN_TIMEOUT:?}");
        }

        self.logs.shutdown(THREAD_JOIN_TIMEOUT);
        self.target.reset();
    }

    /// Marks the start `attempt` of `name` as failed unless a newer start or a stop superseded it.
    fn fail_attempt(&self, name: &str, attempt: u64) {
        let mut processes = lock(&self.processes);
        let entry = processes.entry(name.to_string()).or_default();
        if entry.owned_by(attempt) {
            entry.status = ProcessStatus::Error;
            entry.handle = None;
            entry.launch_mode = None;
        } else {
            debug!("Start attempt {attempt} of '{name}' was superseded");
        }
    }

    /// Records a failure detected before spawning, leaving an active process untouched.
    fn fail_idle(&self, name: &str) {
        let mut processes = lock(&self.processes);
        let entry = processes.entry(name.to_string()).or_default();
        if matches!(entry.status, ProcessStatus::Stopped | ProcessStatus::Error) {
            entry.status = ProcessStatus::Error;
        }
    }

    /// Ensures the watchdog thread is running.
    fn spawn_watchdog(&self) {
        let mut handle_slot = lock(&self.watchdog_handle);
        let should_spawn = match handle_slot.as_ref() {
            Some(handle) => handle.is_finished(),
            None => true,
        };

        if should_spawn {
            debug!("Starting watchdog thread...");
            self.running.store(true, Ordering::SeqCst);

            let processes = Arc::clone(&self.processes);
            let running = Arc::clone(&self.running);
            let interval = self.settings.watchdog_interval;

            *handle_slot = Some(thread::spawn(move || {
                Self::watchdog_loop(processes, running, interval);
            }));
        }
    }

    fn watchdog_loop(
        processes: Arc<Mutex<HashMap<String, ManagedProcess>>>,
        running: Arc<AtomicBool>,
        interval: Duration,
    ) {
        while sleep_while_running(interval, &running) {
            Self::check_liveness(&processes);
        }
        debug!("Watchdog exited");
    }

    /// Moves every running process whose OS process has exited to `Error`.
    fn check_liveness(processes: &Mutex<HashMap<String, ManagedProcess>>) {
        let mut locked_processes = lock(processes);
        for (name, entry) in locked_processes.iter_mut() {
            if entry.status != ProcessStatus::Running {
                continue;
            }

            let exited = match entry.handle.as_mut() {
                Some(ProcessHandle::Direct(child)) => match child.try_wait() {
                    Ok(Some(status)) => {
                        warn!("Process '{name}' exited unexpectedly with {status}");
                        true
                    }
                    Ok(None) => false,
                    Err(err) => {
                        error!("Failed to check status of '{name}': {err}");
                        false
                    }
                },
                Some(ProcessHandle::Elevated { pid: Some(pid), .. }) => {
                    let gone = !pid_alive(*pid);
                    if gone {
                        warn!("Elevated process '{name}' (PID {pid}) exited unexpectedly");
                    }
                    gone
                }
                Some(ProcessHandle::Elevated { pid: None, .. }) => false,
                None => {
                    warn!("Process '{name}' is running without a handle");
                    true
                }
            };

            if exited {
                entry.status = ProcessStatus::Error;
                entry.handle = None;
                entry.launch_mode = None;
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Wait for a child process with a timeout, returning `Ok(None)` on timeout.
pub fn wait_with_timeout(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;

    loop {
        match child.try_wait()? {
            Some(status) => return Ok(Some(status)),
            None => {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                thread::sleep(EXIT_POLL_INTERVAL);
            }
        }
    }
}

fn sleep_while_running(duration: Duration, running: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(STOP_CHECK_STEP));
    }
}

#[cfg(unix)]
fn request_termination(name: &str, child: &mut Child) {
    use nix::{
        errno::Errno,
        sys::signal::{Signal, kill},
        unistd::Pid,
    };

    let Ok(raw) = i32::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };

    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => debug!("Sent SIGTERM to '{name}' (PID {raw})"),
        Err(Errno::ESRCH) => debug!("Process '{name}' exited before SIGTERM"),
        Err(err) => {
            warn!("Failed to signal '{name}': {err}; killing");
            let _ = child.kill();
        }
    }
}

#[cfg(not(unix))]
fn request_termination(name: &str, child: &mut Child) {
    debug!("Terminating '{name}' (PID {})", child.id());
    let _ = child.kill();
}

/// Resolves `path` to an existing executable. Bare names are searched on `PATH`.
pub fn locate_executable(path: &Path) -> Option<PathBuf> {
    let is_bare = path.components().count() == 1 && !path.is_absolute();
    if !is_bare {
        return path.is_file().then(|| path.to_path_buf());
    }

    if path.is_file() {
        return Some(path.to_path_buf());
    }

    let search = env::var_os("PATH")?;
    env::split_paths(&search).find_map(|dir| {
        let candidate = dir.join(path);
        if candidate.is_file() {
            return Some(candidate);
        }
        if cfg!(windows) {
            let with_exe = candidate.with_extension("exe");
            if with_exe.is_file() {
                return Some(with_exe);
            }
        }
        None
    })
}
