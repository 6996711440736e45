//! Mock collaborators for testing and development.
//!
//! These stand in for the external pieces the core talks to (lock manager
//! plugin, QEMU monitor, security/cgroup/namespace/hostdev/memlock
//! managers, chain prober). Each records the calls it receives so tests can
//! assert on their order, and can be told to fail specific calls.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::access::{CgroupManager, HostdevManager, MemlockManager, NamespaceManager, SecurityManager};
use crate::domain::DomainObj;
use crate::error::{BlockJobError, Result};
use crate::lock::driver::{
    AcquireFlags, LockDriver, LockManager, LockObject, LockResource, NewManagerFlags, ResourceFlags,
};
use crate::monitor::{Monitor, MonitorJobInfo, NamedBlockNode};
use crate::prober::ChainProber;
use crate::types::{LockFailureAction, NvmeAddress, StorageSource};

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// LOCK MANAGER
// =============================================================================

/// A call received by a [`RecordingLockDriver`] manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockCall {
    NewManager {
        object: String,
        /// `key=value` object parameters as handed to the plugin
        params: Vec<String>,
        started: bool,
    },
    AddResource(String),
    Acquire {
        state: Option<String>,
        flags: AcquireFlags,
        action: LockFailureAction,
    },
    Release,
    Inquire,
    Free,
}

#[derive(Debug, Default)]
struct LockState {
    calls: Vec<LockCall>,
    added: Vec<LockResource>,
    held: HashMap<String, (Uuid, ResourceFlags)>,
    released: Vec<String>,
    fail_add: HashSet<String>,
    last_acquire_state: Option<String>,
}

/// Lock plugin that enforces exclusion in memory and records every call.
#[derive(Debug, Default)]
pub struct RecordingLockDriver {
    state: Arc<Mutex<LockState>>,
    stateless: bool,
}

impl RecordingLockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report that the plugin keeps no state across pause/resume.
    pub fn stateless(mut self) -> Self {
        self.stateless = true;
        self
    }

    /// Make `add_resource` fail for the resource called `name`.
    pub fn fail_add_resource(&self, name: &str) {
        locked(&self.state).fail_add.insert(name.to_string());
    }

    pub fn calls(&self) -> Vec<LockCall> {
        locked(&self.state).calls.clone()
    }

    /// Every resource added to any manager, in order.
    pub fn added_resources(&self) -> Vec<LockResource> {
        locked(&self.state).added.clone()
    }

    /// Names of the resources currently held by anyone.
    pub fn held(&self) -> HashSet<String> {
        locked(&self.state).held.keys().cloned().collect()
    }

    /// Names of the resources passed to release, in order.
    pub fn released(&self) -> Vec<String> {
        locked(&self.state).released.clone()
    }

    pub fn last_acquire_state(&self) -> Option<String> {
        locked(&self.state).last_acquire_state.clone()
    }
}

impl LockDriver for RecordingLockDriver {
    fn name(&self) -> &str {
        "recording"
    }

    fn uses_state(&self) -> bool {
        !self.stateless
    }

    fn new_manager(&self, object: &LockObject, flags: NewManagerFlags) -> Result<Box<dyn LockManager>> {
        locked(&self.state).calls.push(LockCall::NewManager {
            object: object.name.clone(),
            params: object
                .params()
                .iter()
                .map(|p| format!("{}={}", p.key, p.value))
                .collect(),
            started: flags.started,
        });
        Ok(Box::new(RecordingLockManager {
            state: self.state.clone(),
            owner: object.uuid,
            domain: object.name.clone(),
            resources: Vec::new(),
        }))
    }
}

struct RecordingLockManager {
    state: Arc<Mutex<LockState>>,
    owner: Uuid,
    domain: String,
    resources: Vec<LockResource>,
}

fn compatible(a: ResourceFlags, b: ResourceFlags) -> bool {
    (a.shared && b.shared) || (a.readonly && b.readonly)
}

impl LockManager for RecordingLockManager {
    fn add_resource(&mut self, resource: LockResource) -> Result<()> {
        let mut state = locked(&self.state);
        state.calls.push(LockCall::AddResource(resource.name.clone()));
        if state.fail_add.contains(&resource.name) {
            return Err(BlockJobError::LockFailed(format!(
                "unable to add resource '{}'",
                resource.name
            )));
        }
        state.added.push(resource.clone());
        self.resources.push(resource);
        Ok(())
    }

    fn acquire(
        &mut self,
        lock_state: Option<&str>,
        flags: AcquireFlags,
        action: LockFailureAction,
    ) -> Result<Option<i32>> {
        let mut state = locked(&self.state);
        state.calls.push(LockCall::Acquire {
            state: lock_state.map(str::to_string),
            flags,
            action,
        });
        state.last_acquire_state = lock_state.map(str::to_string);

        if flags.register_only {
            debug!(domain = %self.domain, "Registered without acquiring");
            return Ok(None);
        }

        for res in &self.resources {
            if let Some((owner, held_flags)) = state.held.get(&res.name) {
                if *owner != self.owner && !compatible(*held_flags, res.flags) {
                    return Err(BlockJobError::LockFailed(format!(
                        "resource '{}' is locked by another domain",
                        res.name
                    )));
                }
            }
        }
        for res in &self.resources {
            state.held.insert(res.name.clone(), (self.owner, res.flags));
        }
        Ok(None)
    }

    fn release(&mut self) -> Result<Option<String>> {
        let mut state = locked(&self.state);
        state.calls.push(LockCall::Release);

        let mut count = 0;
        for res in &self.resources {
            state.released.push(res.name.clone());
            if state.held.get(&res.name).is_some_and(|(owner, _)| *owner == self.owner) {
                state.held.remove(&res.name);
                count += 1;
            }
        }
        Ok(Some(format!("{}:{}", self.domain, count)))
    }

    fn inquire(&mut self) -> Result<Option<String>> {
        let mut state = locked(&self.state);
        state.calls.push(LockCall::Inquire);
        let owned = state.held.values().filter(|(owner, _)| *owner == self.owner).count();
        Ok(Some(format!("{}:{}", self.domain, owned)))
    }
}

impl Drop for RecordingLockManager {
    fn drop(&mut self) {
        locked(&self.state).calls.push(LockCall::Free);
    }
}

// =============================================================================
// MONITOR
// =============================================================================

/// A command received by [`MockMonitor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorCall {
    QueryBlockJobs,
    QueryNamedBlockNodes,
    BlockJobComplete(String),
    BlockJobCancel { job: String, force: bool },
    DeleteSnapshot { device: String, snapshot: String },
}

#[derive(Debug, Default)]
struct MonitorState {
    calls: Vec<MonitorCall>,
    jobs: Vec<MonitorJobInfo>,
    nodes: Vec<NamedBlockNode>,
    fail: HashSet<String>,
}

/// In-memory monitor returning canned replies.
#[derive(Debug, Default)]
pub struct MockMonitor {
    state: Mutex<MonitorState>,
}

impl MockMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_jobs(self, jobs: Vec<MonitorJobInfo>) -> Self {
        locked(&self.state).jobs = jobs;
        self
    }

    pub fn with_nodes(self, nodes: Vec<NamedBlockNode>) -> Self {
        locked(&self.state).nodes = nodes;
        self
    }

    /// Make the command called `name` (e.g. `block-job-complete`) fail.
    pub fn fail_on(&self, name: &str) {
        locked(&self.state).fail.insert(name.to_string());
    }

    pub fn calls(&self) -> Vec<MonitorCall> {
        locked(&self.state).calls.clone()
    }

    fn record(&self, name: &str, call: MonitorCall) -> Result<()> {
        let mut state = locked(&self.state);
        state.calls.push(call);
        if state.fail.contains(name) {
            return Err(BlockJobError::Monitor(format!("{} failed", name)));
        }
        Ok(())
    }
}

#[async_trait]
impl Monitor for MockMonitor {
    async fn query_block_jobs(&self) -> Result<Vec<MonitorJobInfo>> {
        self.record("query-block-jobs", MonitorCall::QueryBlockJobs)?;
        Ok(locked(&self.state).jobs.clone())
    }

    async fn query_named_block_nodes(&self) -> Result<Vec<NamedBlockNode>> {
        self.record("query-named-block-nodes", MonitorCall::QueryNamedBlockNodes)?;
        Ok(locked(&self.state).nodes.clone())
    }

    async fn block_job_complete(&self, job: &str) -> Result<()> {
        self.record("block-job-complete", MonitorCall::BlockJobComplete(job.to_string()))
    }

    async fn block_job_cancel(&self, job: &str, force: bool) -> Result<()> {
        self.record(
            "block-job-cancel",
            MonitorCall::BlockJobCancel {
                job: job.to_string(),
                force,
            },
        )
    }

    async fn delete_snapshot(&self, device: &str, snapshot: &str) -> Result<()> {
        self.record(
            "delete-snapshot",
            MonitorCall::DeleteSnapshot {
                device: device.to_string(),
                snapshot: snapshot.to_string(),
            },
        )
    }
}

// =============================================================================
// STORAGE ACCESS COLLABORATORS
// =============================================================================

/// A call received by [`RecordingAccess`]. Images are identified by
/// [`StorageSource::describe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessCall {
    SetLabel { path: String, chain: bool, chain_top: bool },
    RestoreLabel { path: String, chain: bool },
    SetupCgroup(String),
    TeardownCgroup(String),
    SetupNamespace(String),
    TeardownNamespace(String),
    PrepareNvme(usize),
    ReleaseNvme(usize),
    GetMemlock,
    SetMemlock(u64),
}

#[derive(Debug, Default)]
struct AccessState {
    calls: Vec<AccessCall>,
    fail: HashSet<String>,
    memlock: u64,
    last_label_readonly: Option<bool>,
}

/// Security, cgroup, namespace, hostdev and memlock manager sharing one
/// ordered call log.
///
/// Failures are injected by method name: `set_label`, `restore_label`,
/// `setup_cgroup`, `teardown_cgroup`, `setup_namespace`,
/// `teardown_namespace`, `prepare_nvme`, `release_nvme`, `get_memlock`,
/// `set_memlock`. A failing call is still recorded.
#[derive(Debug, Default)]
pub struct RecordingAccess {
    state: Mutex<AccessState>,
}

impl RecordingAccess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memlock_limit(self, bytes: u64) -> Self {
        locked(&self.state).memlock = bytes;
        self
    }

    pub fn fail_on(&self, method: &str) {
        locked(&self.state).fail.insert(method.to_string());
    }

    pub fn calls(&self) -> Vec<AccessCall> {
        locked(&self.state).calls.clone()
    }

    /// Forget recorded calls and injected failures.
    pub fn clear(&self) {
        let mut state = locked(&self.state);
        state.calls.clear();
        state.fail.clear();
    }

    pub fn memlock_limit(&self) -> u64 {
        locked(&self.state).memlock
    }

    /// Read-only flag of the image seen by the last label call.
    pub fn last_label_readonly(&self) -> Option<bool> {
        locked(&self.state).last_label_readonly
    }

    fn record(&self, method: &str, call: AccessCall, err: fn(String) -> BlockJobError) -> Result<()> {
        let mut state = locked(&self.state);
        state.calls.push(call);
        if state.fail.contains(method) {
            return Err(err(format!("{} failed", method)));
        }
        Ok(())
    }
}

impl SecurityManager for RecordingAccess {
    fn set_image_label(&self, _vm: &DomainObj, src: &StorageSource, chain: bool, chain_top: bool) -> Result<()> {
        locked(&self.state).last_label_readonly = Some(src.readonly);
        self.record(
            "set_label",
            AccessCall::SetLabel {
                path: src.describe(),
                chain,
                chain_top,
            },
            BlockJobError::Security,
        )
    }

    fn restore_image_label(&self, _vm: &DomainObj, src: &StorageSource, chain: bool) -> Result<()> {
        self.record(
            "restore_label",
            AccessCall::RestoreLabel {
                path: src.describe(),
                chain,
            },
            BlockJobError::Security,
        )
    }
}

impl CgroupManager for RecordingAccess {
    fn setup_image(&self, _vm: &DomainObj, src: &StorageSource) -> Result<()> {
        self.record("setup_cgroup", AccessCall::SetupCgroup(src.describe()), BlockJobError::Cgroup)
    }

    fn teardown_image(&self, _vm: &DomainObj, src: &StorageSource) -> Result<()> {
        self.record(
            "teardown_cgroup",
            AccessCall::TeardownCgroup(src.describe()),
            BlockJobError::Cgroup,
        )
    }
}

impl NamespaceManager for RecordingAccess {
    fn setup_disk(&self, _vm: &DomainObj, src: &StorageSource) -> Result<()> {
        self.record(
            "setup_namespace",
            AccessCall::SetupNamespace(src.describe()),
            BlockJobError::Namespace,
        )
    }

    fn teardown_disk(&self, _vm: &DomainObj, src: &StorageSource) -> Result<()> {
        self.record(
            "teardown_namespace",
            AccessCall::TeardownNamespace(src.describe()),
            BlockJobError::Namespace,
        )
    }
}

impl HostdevManager for RecordingAccess {
    fn prepare_nvme(&self, _vm: &DomainObj, devices: &[NvmeAddress]) -> Result<()> {
        self.record("prepare_nvme", AccessCall::PrepareNvme(devices.len()), BlockJobError::Hostdev)
    }

    fn release_nvme(&self, _vm: &DomainObj, devices: &[NvmeAddress]) -> Result<()> {
        self.record("release_nvme", AccessCall::ReleaseNvme(devices.len()), BlockJobError::Hostdev)
    }
}

impl MemlockManager for RecordingAccess {
    fn get_limit(&self, _pid: u32) -> Result<u64> {
        self.record("get_memlock", AccessCall::GetMemlock, BlockJobError::Memlock)?;
        Ok(locked(&self.state).memlock)
    }

    fn set_limit(&self, _pid: u32, bytes: u64) -> Result<()> {
        self.record("set_memlock", AccessCall::SetMemlock(bytes), BlockJobError::Memlock)?;
        locked(&self.state).memlock = bytes;
        Ok(())
    }
}

// =============================================================================
// CHAIN PROBER
// =============================================================================

/// Prober answering from a fixed table keyed by image path.
#[derive(Debug, Default)]
pub struct StaticProber {
    chains: HashMap<String, StorageSource>,
}

impl StaticProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `chain` as the backing chain of the image at `path`.
    pub fn with_chain(mut self, path: impl Into<String>, chain: StorageSource) -> Self {
        self.chains.insert(path.into(), chain);
        self
    }
}

impl ChainProber for StaticProber {
    fn probe_backing(&self, top: &StorageSource) -> Result<Option<StorageSource>> {
        Ok(top.path.as_ref().and_then(|p| self.chains.get(p)).cloned())
    }
}
