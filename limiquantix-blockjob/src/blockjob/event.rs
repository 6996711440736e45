//! Applying QEMU block job events to disks and jobs.
//!
//! Events are buffered in the job's `newstate` slot, which holds exactly
//! one pending event: a second event arriving before the first was
//! processed replaces it. While a caller waits on the job synchronously
//! (between [`BlockJobEventProcessor::sync_begin`] and
//! [`BlockJobEventProcessor::sync_end`]) events are only buffered and the
//! waiter applies them itself.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::chain::{backing_store_clear, init_chain_element};
use crate::domain::DomainObj;
use crate::driver::DriverContext;
use crate::error::{BlockJobError, Result};
use crate::events::{BlockJobStatus, DomainEvent};
use crate::types::{BlockJobType, DiskMirrorState};

use super::{unbind_disk, BlockJobState, JobRef};

/// Result of applying one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventOutcome {
    pub state: BlockJobState,
    pub errmsg: Option<String>,
    /// The disk switched to a new image whose node names must be
    /// re-detected from QEMU.
    pub redetect_node_names: bool,
}

/// Reconciles monitor events with disk and job state.
#[derive(Debug, Clone)]
pub struct BlockJobEventProcessor {
    ctx: Arc<DriverContext>,
}

impl BlockJobEventProcessor {
    pub fn new(ctx: Arc<DriverContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &DriverContext {
        &self.ctx
    }

    /// Record an event for job `name` and apply it unless a synchronous
    /// waiter owns the job.
    #[instrument(skip(self, vm, errmsg), fields(domain = %vm.def.name))]
    pub fn handle_event(
        &self,
        vm: &mut DomainObj,
        name: &str,
        status: BlockJobState,
        errmsg: Option<String>,
    ) -> Option<EventOutcome> {
        let Some(job) = vm.private.blockjobs.get_mut(name) else {
            debug!(job = %name, "Event for unknown block job ignored");
            return None;
        };

        if let Some(pending) = job.newstate {
            debug!(job = %name, dropped = %pending, "Replacing unprocessed block job event");
        }
        job.newstate = Some(status);
        job.errmsg = errmsg;

        if job.synchronous {
            debug!(job = %name, "Deferring event to synchronous waiter");
            return None;
        }

        self.process(vm, name)
    }

    /// Apply the pending event of `job`, if any.
    pub fn update(&self, vm: &mut DomainObj, job: &JobRef) -> Option<EventOutcome> {
        self.process(vm, job.name())
    }

    /// Start waiting for `job` synchronously. Events from now on are only
    /// buffered.
    pub fn sync_begin(&self, vm: &mut DomainObj, job: &JobRef) {
        if let Some(job) = vm.private.blockjobs.get_mut(job.name()) {
            debug!(job = %job.name, "Synchronous wait begins");
            job.synchronous = true;
            job.newstate = None;
        }
    }

    /// Finish a synchronous wait, applying any buffered event.
    pub fn sync_end(&self, vm: &mut DomainObj, job: &JobRef) -> Option<EventOutcome> {
        let outcome = self.update(vm, job);
        if let Some(job) = vm.private.blockjobs.get_mut(job.name()) {
            debug!(job = %job.name, "Synchronous wait ends");
            job.synchronous = false;
        }
        outcome
    }

    fn process(&self, vm: &mut DomainObj, name: &str) -> Option<EventOutcome> {
        let job = vm.private.blockjobs.get_mut(name)?;
        let state = job.newstate.take()?;
        let errmsg = job.errmsg.clone();
        let job_type = job.job_type;
        let dst = job.disk().map(str::to_string);

        info!(job = %name, job_type = %job_type.as_str(), state = %state, "Processing block job event");

        let mut redetect_node_names = false;
        if let Some(dst) = &dst {
            let event_type = self.event_job_type(vm, dst, job_type);
            redetect_node_names = self.apply_disk_transition(vm, dst, state);
            self.emit_events(vm, dst, event_type, state);
        }

        if let Some(job) = vm.private.blockjobs.get_mut(name) {
            job.state = state;
        }
        if state.is_terminal() {
            unbind_disk(vm, name);
        }

        if let Err(e) = self.ctx.store.save_status(vm) {
            warn!(domain = %vm.def.name, error = %e, "Unable to save status on block job event");
        }

        if state == BlockJobState::Completed {
            if let Some(new_def) = &vm.new_def {
                if let Err(e) = self.ctx.store.save_config(new_def) {
                    warn!(domain = %vm.def.name, error = %e, "Unable to update persistent definition on block job event");
                }
            }
        }

        Some(EventOutcome {
            state,
            errmsg,
            redetect_node_names,
        })
    }

    /// Job type reported to observers. A commit running on the active
    /// layer is reported as active-commit.
    fn event_job_type(&self, vm: &DomainObj, dst: &str, job_type: BlockJobType) -> BlockJobType {
        match vm.def.disk(dst) {
            Some(disk) if job_type == BlockJobType::Commit && disk.mirror_job == BlockJobType::ActiveCommit => {
                BlockJobType::ActiveCommit
            }
            _ => job_type,
        }
    }

    /// Returns whether node names need re-detection.
    fn apply_disk_transition(&self, vm: &mut DomainObj, dst: &str, state: BlockJobState) -> bool {
        match state {
            BlockJobState::Ready => {
                if let Some(disk) = vm.def.disk_mut(dst) {
                    if disk.mirror.is_some() {
                        disk.mirror_state = DiskMirrorState::Ready;
                    }
                }
                false
            }
            BlockJobState::Completed => {
                let pivot = vm
                    .def
                    .disk(dst)
                    .is_some_and(|d| d.mirror_state == DiskMirrorState::Pivot && d.mirror.is_some());
                if pivot {
                    self.complete_pivot(vm, dst);
                    true
                } else {
                    self.drop_mirror(vm, dst);
                    false
                }
            }
            BlockJobState::Failed | BlockJobState::Cancelled => {
                self.drop_mirror(vm, dst);
                false
            }
            _ => false,
        }
    }

    /// Make the mirror the disk's image.
    fn complete_pivot(&self, vm: &mut DomainObj, dst: &str) {
        let Some(disk) = vm.def.disk(dst) else {
            return;
        };
        let old_src = disk.src.clone();
        let Some(mirror) = disk.mirror.clone() else {
            return;
        };

        if let Some(persist) = vm.new_def.as_mut().and_then(|d| d.disk_mut(dst)) {
            let mut copy = mirror.clone();
            copy.backing_store = None;
            init_chain_element(&mut copy, &persist.src, true);
            persist.src = copy;
        }

        if let Err(e) = self.ctx.locks.image_detach(vm, &old_src) {
            warn!(path = %old_src.describe(), error = %e, "Unable to release lock on old disk source");
        }

        let Some(disk) = vm.def.disk_mut(dst) else {
            return;
        };
        disk.src = mirror;
        disk.mirror = None;
        disk.mirror_state = DiskMirrorState::None;
        disk.mirror_job = BlockJobType::Unknown;
        backing_store_clear(&mut disk.src);

        match self.ctx.prober.probe_backing(&disk.src) {
            Ok(Some(chain)) => disk.src.backing_store = Some(Box::new(chain)),
            Ok(None) => {}
            Err(e) => warn!(disk = %dst, error = %e, "Unable to probe backing chain after pivot"),
        }

        info!(disk = %dst, path = %disk.src.describe(), "Disk pivoted to mirror");
    }

    /// Release and forget the disk's mirror.
    fn drop_mirror(&self, vm: &mut DomainObj, dst: &str) {
        let mirror = vm.def.disk(dst).and_then(|d| d.mirror.clone());

        if let Some(mirror) = &mirror {
            if let Err(e) = self.ctx.locks.image_detach(vm, mirror) {
                warn!(path = %mirror.describe(), error = %e, "Unable to release lock on mirror");
            }
        }

        if let Some(disk) = vm.def.disk_mut(dst) {
            disk.mirror = None;
            disk.mirror_state = DiskMirrorState::None;
            disk.mirror_job = BlockJobType::Unknown;
        }
    }

    fn emit_events(&self, vm: &DomainObj, dst: &str, job_type: BlockJobType, state: BlockJobState) {
        let status = match state {
            BlockJobState::Completed => BlockJobStatus::Completed,
            BlockJobState::Failed => BlockJobStatus::Failed,
            BlockJobState::Cancelled => BlockJobStatus::Cancelled,
            BlockJobState::Ready => BlockJobStatus::Ready,
            _ => return,
        };
        let Some(disk) = vm.def.disk(dst) else {
            return;
        };

        if disk.src.is_local() && !disk.src.is_empty() {
            if let Some(path) = &disk.src.path {
                self.ctx.events.queue_event(DomainEvent::BlockJob {
                    domain: vm.def.name.clone(),
                    path: path.clone(),
                    job_type,
                    status,
                });
            }
        }

        self.ctx.events.queue_event(DomainEvent::BlockJob2 {
            domain: vm.def.name.clone(),
            disk: dst.to_string(),
            job_type,
            status,
        });
    }
}

/// Mark the two-phase job on disk `dst` as pivoting.
///
/// Returns the job name to complete through the monitor. Fails unless the
/// disk has a copy or active-commit job whose mirror is ready.
pub fn request_pivot(vm: &mut DomainObj, dst: &str) -> Result<String> {
    let disk = vm
        .def
        .disk(dst)
        .ok_or_else(|| BlockJobError::NotFound(format!("disk '{}'", dst)))?;

    let name = disk.private.blockjob.clone().ok_or_else(|| {
        BlockJobError::OperationInvalid(format!("disk '{}' does not have an active block job", dst))
    })?;

    let job = vm
        .private
        .blockjobs
        .get_mut(&name)
        .ok_or_else(|| BlockJobError::Internal(format!("block job '{}' is not registered", name)))?;

    if !matches!(job.job_type, BlockJobType::Copy | BlockJobType::ActiveCommit) {
        return Err(BlockJobError::OperationInvalid(format!(
            "job type '{}' does not support pivot",
            job.job_type.as_str()
        )));
    }

    if disk.mirror.is_none() || disk.mirror_state != DiskMirrorState::Ready {
        return Err(BlockJobError::OperationInvalid(format!(
            "disk '{}' not ready for pivot yet",
            dst
        )));
    }

    job.state = BlockJobState::Pivoting;
    if let Some(disk) = vm.def.disk_mut(dst) {
        disk.mirror_state = DiskMirrorState::Pivot;
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockjob::{self, BlockJob, JobBinding};
    use crate::config::DriverConfig;
    use crate::domain::DomainState;
    use crate::events::EventQueue;
    use crate::lock::LockManagerPlugin;
    use crate::mock::{RecordingLockDriver, StaticProber};
    use crate::status::StatusStore;
    use crate::types::{DiskDef, DomainDef, StorageSource};

    struct Fixture {
        processor: BlockJobEventProcessor,
        events: Arc<EventQueue>,
        locks: Arc<RecordingLockDriver>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(EventQueue::new());
        let locks = Arc::new(RecordingLockDriver::new());
        let prober = StaticProber::new().with_chain(
            "/img/vda-copy.qcow2",
            StorageSource::file("/img/base.qcow2").with_backing(StorageSource::empty()),
        );

        let ctx = DriverContext::new(DriverConfig::default())
            .unwrap()
            .with_store(StatusStore::new(dir.path().join("run"), dir.path().join("etc")))
            .with_events(events.clone())
            .with_prober(Arc::new(prober))
            .with_lock_plugin(LockManagerPlugin::with_driver(locks.clone()));

        Fixture {
            processor: BlockJobEventProcessor::new(Arc::new(ctx)),
            events,
            locks,
            _dir: dir,
        }
    }

    fn vm_with_copy() -> (DomainObj, JobRef) {
        let mut vda = DiskDef::new("vda", StorageSource::file("/img/vda.qcow2"));
        vda.mirror = Some(StorageSource::file("/img/vda-copy.qcow2"));
        vda.mirror_job = BlockJobType::Copy;

        let mut vm = DomainObj::new(DomainDef::new("vm1").with_disk(vda));
        vm.state = DomainState::Running;

        let job = BlockJob::new("copy-vda", BlockJobType::Copy).with_binding(JobBinding::Disk {
            dst: "vda".to_string(),
            mirror: true,
        });
        let handle = blockjob::register_for_disk(&mut vm, job, Some("vda"), None).unwrap();
        blockjob::mark_started(&mut vm, &handle);
        (vm, handle)
    }

    #[test]
    fn test_ready_then_pivot() {
        let f = fixture();
        let (mut vm, handle) = vm_with_copy();

        let outcome = f.processor.handle_event(&mut vm, "copy-vda", BlockJobState::Ready, None).unwrap();
        assert!(!outcome.redetect_node_names);
        assert_eq!(vm.def.disk("vda").unwrap().mirror_state, DiskMirrorState::Ready);

        assert_eq!(request_pivot(&mut vm, "vda").unwrap(), "copy-vda");

        let outcome = f.processor.handle_event(&mut vm, "copy-vda", BlockJobState::Completed, None).unwrap();
        assert!(outcome.redetect_node_names);

        let disk = vm.def.disk("vda").unwrap();
        assert_eq!(disk.src.path.as_deref(), Some("/img/vda-copy.qcow2"));
        assert!(disk.mirror.is_none());
        assert_eq!(disk.mirror_state, DiskMirrorState::None);
        assert_eq!(
            disk.src.backing_store.as_ref().and_then(|b| b.path.as_deref()),
            Some("/img/base.qcow2")
        );
        assert!(disk.private.blockjob.is_none());
        assert!(f.locks.released().contains(&"/img/vda.qcow2".to_string()));

        let statuses: Vec<_> = f.events.get_all().iter().map(|e| e.status()).collect();
        assert_eq!(
            statuses,
            vec![
                BlockJobStatus::Ready,
                BlockJobStatus::Ready,
                BlockJobStatus::Completed,
                BlockJobStatus::Completed
            ]
        );
        vm.private.blockjobs.release(handle);
    }

    #[test]
    fn test_failure_drops_mirror_and_frees_disk() {
        let f = fixture();
        let (mut vm, handle) = vm_with_copy();

        f.processor
            .handle_event(&mut vm, "copy-vda", BlockJobState::Failed, Some("I/O error".to_string()))
            .unwrap();

        let disk = vm.def.disk("vda").unwrap();
        assert_eq!(disk.src.path.as_deref(), Some("/img/vda.qcow2"));
        assert!(disk.mirror.is_none());
        assert!(!blockjob::has_active_job(&vm, false));
        assert!(f.locks.released().contains(&"/img/vda-copy.qcow2".to_string()));

        let job = vm.private.blockjobs.get("copy-vda").unwrap();
        assert_eq!(job.state, BlockJobState::Failed);
        assert_eq!(job.errmsg.as_deref(), Some("I/O error"));
        vm.private.blockjobs.release(handle);
    }

    #[test]
    fn test_last_event_wins_while_synchronous() {
        let f = fixture();
        let (mut vm, handle) = vm_with_copy();

        f.processor.sync_begin(&mut vm, &handle);
        assert!(f.processor.handle_event(&mut vm, "copy-vda", BlockJobState::Completed, None).is_none());
        assert!(f
            .processor
            .handle_event(&mut vm, "copy-vda", BlockJobState::Failed, Some("boom".to_string()))
            .is_none());

        // nothing applied yet
        assert!(vm.def.disk("vda").unwrap().mirror.is_some());
        assert!(f.events.is_empty());

        let outcome = f.processor.sync_end(&mut vm, &handle).unwrap();
        assert_eq!(outcome.state, BlockJobState::Failed);
        assert_eq!(outcome.errmsg.as_deref(), Some("boom"));
        assert!(!vm.private.blockjobs.get("copy-vda").unwrap().synchronous);

        let statuses: Vec<_> = f.events.get_all().iter().map(|e| e.status()).collect();
        assert_eq!(statuses, vec![BlockJobStatus::Failed, BlockJobStatus::Failed]);
        vm.private.blockjobs.release(handle);
    }

    #[test]
    fn test_active_commit_reported_as_such() {
        let f = fixture();
        let mut vda = DiskDef::new("vda", StorageSource::network("rbd", "pool/vda"));
        vda.mirror = Some(StorageSource::network("rbd", "pool/base"));
        vda.mirror_job = BlockJobType::ActiveCommit;
        let mut vm = DomainObj::new(DomainDef::new("vm1").with_disk(vda));
        vm.state = DomainState::Running;

        let handle = blockjob::register_for_disk(
            &mut vm,
            BlockJob::new("commit-vda", BlockJobType::Commit),
            Some("vda"),
            None,
        )
        .unwrap();
        f.processor.handle_event(&mut vm, "commit-vda", BlockJobState::Ready, None);

        // network disk: only the target-keyed event
        let events = f.events.get_all();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            DomainEvent::BlockJob2 { job_type: BlockJobType::ActiveCommit, .. }
        ));
        vm.private.blockjobs.release(handle);
    }

    #[test]
    fn test_pivot_requires_ready_mirror() {
        let (mut vm, handle) = vm_with_copy();
        let err = request_pivot(&mut vm, "vda").unwrap_err();
        assert!(err.to_string().contains("not ready for pivot"));
        vm.private.blockjobs.release(handle);
    }

    #[test]
    fn test_pivot_updates_persistent_definition() {
        let f = fixture();
        let (mut vm, handle) = vm_with_copy();
        let mut persistent = vm.def.clone();
        persistent.disks[0].src.readonly = true;
        persistent.disks[0].mirror = None;
        vm.new_def = Some(persistent);

        f.processor.handle_event(&mut vm, "copy-vda", BlockJobState::Ready, None);
        request_pivot(&mut vm, "vda").unwrap();
        f.processor.handle_event(&mut vm, "copy-vda", BlockJobState::Completed, None);

        let persist = vm.new_def.as_ref().unwrap().disk("vda").unwrap();
        assert_eq!(persist.src.path.as_deref(), Some("/img/vda-copy.qcow2"));
        assert!(persist.src.readonly);
        assert!(persist.src.backing_store.is_none());
        assert!(f._dir.path().join("etc/vm1.xml").exists());
        vm.private.blockjobs.release(handle);
    }
}
