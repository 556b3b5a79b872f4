//! State of the target process: the client launched by the control plane.
//!
//! The supervisor does not own this process. Its PID and identity are learned
//! through the control-plane RPC, and its resources through [`ResourceSampler`].
use std::sync::{
    Arc, Mutex, RwLock,
    atomic::{AtomicBool, Ordering},
};

use serde::Serialize;
use tracing::{debug, info};

use crate::{
    lock,
    metrics::{ResourceSample, ResourceSampler, pid_alive},
    rpc::{ControlPlaneClient, SelfInfo},
};

/// Resource and identity snapshot of the target process.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TargetProcessInfo {
    /// PID, once discovered.
    pub pid: Option<u32>,
    /// Last sampled CPU usage.
    pub cpu_percent: f32,
    /// Last sampled resident memory in MiB.
    pub memory_mb: f64,
    /// Logged-in account id. Sticky for the session.
    pub account_id: Option<String>,
    /// Display name of the logged-in account.
    pub display_name: Option<String>,
    /// Client build version.
    pub client_version: Option<String>,
}

impl TargetProcessInfo {
    /// Whether both account id and a non-empty display name are known.
    pub fn identity_complete(&self) -> bool {
        self.account_id.is_some()
            && self
                .display_name
                .as_deref()
                .is_some_and(|name| !name.is_empty())
    }
}

/// Identity passed to the change callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Account id.
    pub account_id: String,
    /// Display name at the time of the change.
    pub display_name: String,
}

/// Callback fired when the account id changes.
pub type IdentityCallback = Box<dyn Fn(&Identity) + Send + Sync>;

/// Shared handle to [`TargetProcessInfo`] plus the sampler and RPC client that feed it.
#[derive(Clone, Default)]
pub struct TargetMonitor {
    info: Arc<Mutex<TargetProcessInfo>>,
    sampler: Arc<Mutex<ResourceSampler>>,
    client: Arc<Mutex<Option<ControlPlaneClient>>>,
    callback: Arc<RwLock<Option<IdentityCallback>>>,
    version_fetched: Arc<AtomicBool>,
}

impl TargetMonitor {
    /// Creates an empty monitor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> TargetProcessInfo {
        lock(&self.info).clone()
    }

    /// Current PID, if any.
    pub fn pid(&self) -> Option<u32> {
        lock(&self.info).pid
    }

    /// Registers the identity-change callback, replacing any previous one.
    pub fn set_identity_callback<F>(&self, callback: F)
    where
        F: Fn(&Identity) + Send + Sync + 'static,
    {
        let mut slot = self
            .callback
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(Box::new(callback));
    }

    /// Points RPC lookups at a control-plane session.
    pub fn attach_client(&self, client: ControlPlaneClient) {
        *lock(&self.client) = Some(client);
        self.version_fetched.store(false, Ordering::SeqCst);
    }

    /// Forgets the control-plane session.
    pub fn detach_client(&self) {
        *lock(&self.client) = None;
    }

    /// Client of the current control-plane session.
    pub fn client(&self) -> Option<ControlPlaneClient> {
        lock(&self.client).clone()
    }

    /// Records a PID. Resource figures are zeroed until the next sample.
    pub fn set_pid(&self, pid: Option<u32>) {
        let mut info = lock(&self.info);
        if info.pid != pid {
            debug!("target pid changed {:?} -> {pid:?}", info.pid);
            info.pid = pid;
            info.cpu_percent = 0.0;
            info.memory_mb = 0.0;
        }
    }

    /// Stores a sample taken for `pid`. A dead sample clears the PID.
    ///
    /// Samples for a PID that was replaced while sampling are discarded.
    pub fn record_sample(&self, pid: u32, sample: ResourceSample) {
        let mut info = lock(&self.info);
        if info.pid != Some(pid) {
            return;
        }
        if sample.alive {
            info.cpu_percent = sample.cpu_percent.max(0.0);
            info.memory_mb = sample.memory_mb.max(0.0);
        } else {
            debug!("target pid {pid} is gone");
            info.pid = None;
            info.cpu_percent = 0.0;
            info.memory_mb = 0.0;
        }
    }

    /// Stores identity. Returns `true` and fires the callback when the account id changed.
    pub fn record_identity(&self, identity: &SelfInfo) -> bool {
        let change = {
            let mut info = lock(&self.info);
            if !identity.nickname.is_empty() {
                info.display_name = Some(identity.nickname.clone());
            }
            if info.account_id.as_deref() == Some(identity.uin.as_str()) {
                None
            } else {
                info.account_id = Some(identity.uin.clone());
                Some(Identity {
                    account_id: identity.uin.clone(),
                    display_name: info.display_name.clone().unwrap_or_default(),
                })
            }
        };

        let Some(change) = change else {
            return false;
        };

        info!("target logged in as {}", change.account_id);
        let callback = self
            .callback
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(callback) = callback.as_ref() {
            callback(&change);
        }
        true
    }

    /// Stores the client build version.
    pub fn set_client_version(&self, version: Option<String>) {
        lock(&self.info).client_version = version;
    }

    /// Samples the target, re-queries its PID when unknown or dead, and
    /// fetches the client version once per control-plane session.
    ///
    /// The CPU measurement window runs without holding the state lock.
    pub fn refresh(&self) {
        if let Some(pid) = self.pid() {
            let sample = lock(&self.sampler).sample(pid);
            self.record_sample(pid, sample);
        }

        let Some(client) = self.client() else {
            return;
        };

        if self.pid().is_none() {
            match client.fetch_process_pid() {
                Ok(Some(pid)) if pid_alive(pid) => self.set_pid(Some(pid)),
                Ok(_) => {}
                Err(err) => debug!("target pid lookup failed: {err}"),
            }
        }

        if !self.version_fetched.load(Ordering::SeqCst) {
            match client.fetch_device_info() {
                Ok(Some(device)) => {
                    self.version_fetched.store(true, Ordering::SeqCst);
                    if !device.build_ver.is_empty() {
                        self.set_client_version(Some(device.build_ver));
                    }
                }
                Ok(None) => {}
                Err(err) => debug!("device info lookup failed: {err}"),
            }
        }
    }

    /// Clears all state and the sampler cache.
    pub fn reset(&self) {
        *lock(&self.info) = TargetProcessInfo::default();
        lock(&self.sampler).invalidate();
        self.detach_client();
    }
}

impl std::fmt::Debug for TargetMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetMonitor")
            .field("info", &self.snapshot())
            .finish()
    }
}
