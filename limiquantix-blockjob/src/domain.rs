//! Domain object and the per-domain lock.
//!
//! [`DomainObj`] is the mutable state of one running domain: its live
//! definition, the optional persistent definition, process data and the
//! private bookkeeping (block job registry, async job). [`Domain`] wraps it
//! in the coarse per-domain mutex and pairs it with the monitor channel.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::blockjob::{self, BlockJobEventProcessor, BlockJobRegistry, BlockJobState};
use crate::error::{BlockJobError, Result};
use crate::monitor::{Monitor, NamedBlockNode};
use crate::types::{BlockJobType, DiskMirrorState, DomainDef, StorageSource};

/// Run state of the domain process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DomainState {
    #[default]
    Shutoff,
    Running,
    Paused,
}

impl DomainState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainState::Shutoff => "shutoff",
            DomainState::Running => "running",
            DomainState::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "shutoff" => Some(DomainState::Shutoff),
            "running" => Some(DomainState::Running),
            "paused" => Some(DomainState::Paused),
            _ => None,
        }
    }
}

/// Long-running asynchronous domain job (at most one at a time).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AsyncJob {
    #[default]
    None,
    MigrationOut,
    MigrationIn,
    Save,
    Dump,
    Snapshot,
    Start,
    Backup,
}

impl AsyncJob {
    pub fn as_str(&self) -> &'static str {
        match self {
            AsyncJob::None => "none",
            AsyncJob::MigrationOut => "migration out",
            AsyncJob::MigrationIn => "migration in",
            AsyncJob::Save => "save",
            AsyncJob::Dump => "dump",
            AsyncJob::Snapshot => "snapshot",
            AsyncJob::Start => "start",
            AsyncJob::Backup => "backup",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(AsyncJob::None),
            "migration out" => Some(AsyncJob::MigrationOut),
            "migration in" => Some(AsyncJob::MigrationIn),
            "save" => Some(AsyncJob::Save),
            "dump" => Some(AsyncJob::Dump),
            "snapshot" => Some(AsyncJob::Snapshot),
            "start" => Some(AsyncJob::Start),
            "backup" => Some(AsyncJob::Backup),
            _ => None,
        }
    }
}

/// Migration parameter carried by an outgoing migration job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationParam {
    pub name: String,
    pub value: String,
}

/// Async job tracking. Persisted only while a job is active; per-disk
/// migration data lives on the disks themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainJobState {
    pub async_job: AsyncJob,
    pub phase: Option<String>,
    pub mig_params: Vec<MigrationParam>,
}

impl DomainJobState {
    pub fn is_active(&self) -> bool {
        self.async_job != AsyncJob::None
    }

    /// Forget the job and its private data.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Private per-domain bookkeeping.
#[derive(Debug, Default)]
pub struct DomainPrivate {
    pub blockjobs: BlockJobRegistry,
    pub job: DomainJobState,
}

/// Mutable state of one domain. Only touched under the domain lock.
#[derive(Debug)]
pub struct DomainObj {
    /// Live definition
    pub def: DomainDef,
    /// Persistent definition to apply on next boot, if any
    pub new_def: Option<DomainDef>,
    pub pid: u32,
    pub state: DomainState,
    pub private: DomainPrivate,
}

impl DomainObj {
    pub fn new(def: DomainDef) -> Self {
        Self {
            def,
            new_def: None,
            pid: 0,
            state: DomainState::Shutoff,
            private: DomainPrivate::default(),
        }
    }

    /// The domain process exists.
    pub fn is_active(&self) -> bool {
        self.state != DomainState::Shutoff
    }

    /// Drop all runtime data once the process is gone.
    pub fn teardown(&mut self) {
        debug!(domain = %self.def.name, jobs = self.private.blockjobs.len(), "Tearing down domain runtime state");
        self.private.blockjobs.clear();
        self.private.job.reset();
        for disk in self.def.disks.iter_mut() {
            disk.private = Default::default();
            disk.mirror = None;
            disk.mirror_state = DiskMirrorState::None;
            disk.mirror_job = BlockJobType::Unknown;
        }
        self.state = DomainState::Shutoff;
        self.pid = 0;
    }

    /// Fill in node names reported by QEMU for layers that have none.
    ///
    /// Layers are matched by image path. Returns the number of names
    /// assigned.
    pub fn apply_node_names(&mut self, nodes: &[NamedBlockNode]) -> usize {
        let mut assigned = 0;

        let mut assign = |src: &mut StorageSource| {
            let Some(path) = src.path.clone() else {
                return;
            };
            for node in nodes.iter().filter(|n| n.file == path) {
                let slot = if node.is_protocol() {
                    &mut src.node_storage
                } else {
                    &mut src.node_format
                };
                if slot.is_none() {
                    *slot = Some(node.node_name.clone());
                    assigned += 1;
                }
            }
        };

        for disk in self.def.disks.iter_mut() {
            crate::chain::for_each_layer_mut(&mut disk.src, &mut assign);
            if let Some(mirror) = disk.mirror.as_mut() {
                crate::chain::for_each_layer_mut(mirror, &mut assign);
            }
        }

        assigned
    }
}

/// A domain object behind its lock, with the monitor channel.
pub struct Domain {
    obj: Mutex<DomainObj>,
    monitor: Arc<dyn Monitor>,
}

impl Domain {
    pub fn new(obj: DomainObj, monitor: Arc<dyn Monitor>) -> Self {
        Self {
            obj: Mutex::new(obj),
            monitor,
        }
    }

    /// Take the domain lock.
    pub async fn lock(&self) -> MutexGuard<'_, DomainObj> {
        self.obj.lock().await
    }

    /// Talk to the monitor without holding the domain lock.
    ///
    /// The guard is released for the duration of the call and re-acquired
    /// afterwards. If the domain process went away meanwhile the result is
    /// discarded and [`BlockJobError::DomainExited`] is returned.
    pub async fn enter_monitor<'a, T, F, Fut>(
        &'a self,
        guard: MutexGuard<'a, DomainObj>,
        f: F,
    ) -> Result<(MutexGuard<'a, DomainObj>, T)>
    where
        F: FnOnce(Arc<dyn Monitor>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let name = guard.def.name.clone();
        drop(guard);

        let result = f(self.monitor.clone()).await;

        let guard = self.obj.lock().await;
        if !guard.is_active() {
            warn!(domain = %name, "Domain exited during monitor call");
            return Err(BlockJobError::DomainExited(name));
        }

        let value = result?;
        Ok((guard, value))
    }

    /// Query QEMU's node names and assign them to layers missing one.
    #[instrument(skip(self, guard), fields(domain = %guard.def.name))]
    pub async fn detect_node_names<'a>(
        &'a self,
        guard: MutexGuard<'a, DomainObj>,
    ) -> Result<MutexGuard<'a, DomainObj>> {
        let (mut guard, nodes) = self
            .enter_monitor(guard, |mon| async move { mon.query_named_block_nodes().await })
            .await?;

        let assigned = guard.apply_node_names(&nodes);
        debug!(assigned, "Node names detected");
        Ok(guard)
    }

    /// Deliver a block job status event from the monitor.
    #[instrument(skip(self, processor, errmsg), fields(job = %job, status = %status))]
    pub async fn handle_block_job_event(
        &self,
        processor: &BlockJobEventProcessor,
        job: &str,
        status: BlockJobState,
        errmsg: Option<String>,
    ) -> Result<()> {
        let mut guard = self.lock().await;
        let outcome = processor.handle_event(&mut guard, job, status, errmsg);

        if outcome.is_some_and(|o| o.redetect_node_names) {
            if let Err(e) = self.detect_node_names(guard).await {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!(error = %e, "Unable to refresh node names after pivot");
            }
        }
        Ok(())
    }

    /// Ask QEMU to switch disk `dst` over to its ready mirror.
    ///
    /// The switch itself is applied when the completion event arrives.
    #[instrument(skip(self), fields(disk = %dst))]
    pub async fn pivot(&self, dst: &str) -> Result<()> {
        let mut guard = self.lock().await;
        if !guard.is_active() {
            return Err(BlockJobError::DomainNotRunning(guard.def.name.clone()));
        }

        let name = blockjob::event::request_pivot(&mut guard, dst)?;

        match self
            .enter_monitor(guard, |mon| {
                let name = name.clone();
                async move { mon.block_job_complete(&name).await }
            })
            .await
        {
            Ok((_guard, ())) => {
                info!(job = %name, "Pivot requested");
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                let mut guard = self.lock().await;
                if let Some(job) = guard.private.blockjobs.get_mut(&name) {
                    if job.state == BlockJobState::Pivoting {
                        job.state = BlockJobState::Ready;
                    }
                }
                if let Some(disk) = guard.def.disk_mut(dst) {
                    if disk.mirror_state == DiskMirrorState::Pivot {
                        disk.mirror_state = DiskMirrorState::Ready;
                    }
                }
                Err(e)
            }
        }
    }

    /// Ask QEMU to cancel the job bound to disk `dst`.
    #[instrument(skip(self), fields(disk = %dst))]
    pub async fn abort(&self, dst: &str, force: bool) -> Result<()> {
        let mut guard = self.lock().await;
        if !guard.is_active() {
            return Err(BlockJobError::DomainNotRunning(guard.def.name.clone()));
        }

        let handle = blockjob::get_by_disk(&mut guard, dst)
            .ok_or_else(|| BlockJobError::OperationInvalid(format!("disk '{}' does not have an active block job", dst)))?;
        let name = handle.name().to_string();
        guard.private.blockjobs.release(handle);

        if let Some(job) = guard.private.blockjobs.get_mut(&name) {
            if job.state.is_running() {
                job.state = BlockJobState::Aborting;
            }
        }
        if let Some(disk) = guard.def.disk_mut(dst) {
            if disk.mirror.is_some() {
                disk.mirror_state = DiskMirrorState::Abort;
            }
        }

        self.enter_monitor(guard, |mon| {
            let name = name.clone();
            async move { mon.block_job_cancel(&name, force).await }
        })
        .await?;
        Ok(())
    }
}

impl std::fmt::Debug for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Domain").finish_non_exhaustive()
    }
}
