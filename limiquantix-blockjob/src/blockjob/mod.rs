//! Block job records and their association with disks.
//!
//! A block job is an asynchronous operation on a disk's backing chain that
//! runs inside QEMU (pull, copy, commit, backup, ...). Jobs are owned by the
//! domain's [`BlockJobRegistry`]; a disk only remembers the name of the job
//! bound to it.
//!
//! Starting a job follows this sequence:
//!
//! ```text
//! BlockJob::new ─► register_for_disk ─► (issue monitor command) ─► mark_started
//!                         │                                           │
//!                         └────────────── startup_finalize ◄──────────┘
//! ```
//!
//! `startup_finalize` must run on every path after a successful
//! `register_for_disk`. If the job never got confirmed by QEMU it is
//! discarded, otherwise only the caller's handle is dropped.

pub mod event;
pub mod registry;

pub use event::{BlockJobEventProcessor, EventOutcome};
pub use registry::{BlockJobRegistry, JobRef};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::DomainObj;
use crate::error::{BlockJobError, Result};
use crate::status::StatusStore;
use crate::types::{BlockJobType, StorageSource};

/// Lifecycle state of a block job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockJobState {
    /// Registered, not yet confirmed by QEMU
    #[default]
    New,
    Running,
    /// Mirror is synchronised, job waits for pivot or abort
    Ready,
    /// QEMU finished the job, result not yet collected
    Concluded,
    Completed,
    Failed,
    Cancelled,
    Aborting,
    Pivoting,
}

impl BlockJobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockJobState::New => "new",
            BlockJobState::Running => "running",
            BlockJobState::Ready => "ready",
            BlockJobState::Concluded => "concluded",
            BlockJobState::Completed => "completed",
            BlockJobState::Failed => "failed",
            BlockJobState::Cancelled => "cancelled",
            BlockJobState::Aborting => "aborting",
            BlockJobState::Pivoting => "pivoting",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(BlockJobState::New),
            "running" => Some(BlockJobState::Running),
            "ready" => Some(BlockJobState::Ready),
            "concluded" => Some(BlockJobState::Concluded),
            "completed" => Some(BlockJobState::Completed),
            "failed" => Some(BlockJobState::Failed),
            "cancelled" | "canceled" => Some(BlockJobState::Cancelled),
            "aborting" => Some(BlockJobState::Aborting),
            "pivoting" => Some(BlockJobState::Pivoting),
            _ => None,
        }
    }

    /// The job has ended one way or another.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BlockJobState::Completed | BlockJobState::Failed | BlockJobState::Cancelled
        )
    }

    /// QEMU is still working on the job.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            BlockJobState::Running
                | BlockJobState::Ready
                | BlockJobState::Aborting
                | BlockJobState::Pivoting
        )
    }
}

impl std::fmt::Display for BlockJobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What storage a job operates on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum JobBinding {
    #[default]
    None,
    /// The job works on a disk of the domain; with `mirror` it also owns
    /// the disk's mirror chain.
    Disk { dst: String, mirror: bool },
    /// The job works on chains that are not (yet) part of any disk.
    Chains {
        chain: Option<StorageSource>,
        mirror_chain: Option<StorageSource>,
    },
}

/// Job-kind specific data. Node references are node names within the
/// job's chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum JobPayload {
    #[default]
    None,
    Pull {
        base: Option<String>,
    },
    Commit {
        top_parent: Option<String>,
        top: Option<String>,
        base: Option<String>,
        delete_committed_images: bool,
    },
    Copy {
        shallow_new: bool,
    },
    Create {
        /// Only the storage (protocol) layer is created
        storage: bool,
        src: StorageSource,
    },
    Backup {
        bitmap: Option<String>,
        store: StorageSource,
    },
}

/// One block job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockJob {
    pub name: String,
    pub job_type: BlockJobType,
    pub state: BlockJobState,
    /// Event received from QEMU but not processed yet
    pub newstate: Option<BlockJobState>,
    pub errmsg: Option<String>,
    /// A caller waits for the job; events are processed by that caller
    pub synchronous: bool,
    /// Flags the job was started with
    pub jobflags: u32,
    /// Flags were not recorded in the persisted state
    pub jobflags_missing: bool,
    /// Reconstructed state could not be fully resolved
    pub invalid_data: bool,
    /// Original type string of a job restored as [`BlockJobType::Broken`]
    pub broken_type: Option<String>,
    pub binding: JobBinding,
    pub payload: JobPayload,
}

impl BlockJob {
    /// Create a job record.
    pub fn new(name: impl Into<String>, job_type: BlockJobType) -> Self {
        let payload = match job_type {
            BlockJobType::Pull => JobPayload::Pull { base: None },
            BlockJobType::Commit | BlockJobType::ActiveCommit => JobPayload::Commit {
                top_parent: None,
                top: None,
                base: None,
                delete_committed_images: false,
            },
            BlockJobType::Copy => JobPayload::Copy { shallow_new: false },
            _ => JobPayload::None,
        };

        Self {
            name: name.into(),
            job_type,
            state: BlockJobState::New,
            newstate: None,
            errmsg: None,
            synchronous: false,
            jobflags: 0,
            jobflags_missing: false,
            invalid_data: false,
            broken_type: None,
            binding: JobBinding::None,
            payload,
        }
    }

    /// A backup job writing into `store`.
    pub fn new_backup(name: impl Into<String>, store: StorageSource, bitmap: Option<String>) -> Self {
        let mut job = Self::new(name, BlockJobType::Backup);
        job.payload = JobPayload::Backup { bitmap, store };
        job
    }

    /// A blockdev-create job for `src`.
    pub fn new_create(name: impl Into<String>, src: StorageSource, storage: bool) -> Self {
        let mut job = Self::new(name, BlockJobType::Create);
        job.payload = JobPayload::Create { storage, src };
        job
    }

    pub fn with_binding(mut self, binding: JobBinding) -> Self {
        self.binding = binding;
        self
    }

    pub fn with_payload(mut self, payload: JobPayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_flags(mut self, jobflags: u32) -> Self {
        self.jobflags = jobflags;
        self
    }

    /// Target of the disk this job is bound to.
    pub fn disk(&self) -> Option<&str> {
        match &self.binding {
            JobBinding::Disk { dst, .. } => Some(dst),
            _ => None,
        }
    }

    /// QEMU has confirmed the job.
    pub fn is_started(&self) -> bool {
        self.state != BlockJobState::New
    }

    /// Whether this job blocks other operations on its disk.
    pub fn is_active(&self) -> bool {
        !self.invalid_data && !self.state.is_terminal()
    }

    /// Return the job to the state of a slot nobody ever used.
    pub fn reset(&mut self) {
        self.job_type = BlockJobType::Unknown;
        self.newstate = None;
        self.errmsg = None;
        self.synchronous = false;
    }
}

/// Register `job` with the domain and, if `dst` is given, bind it to that
/// disk.
///
/// Fails without changing anything if the disk already has an active job
/// or the name is taken. A concluded or invalid job left on the disk is
/// replaced. With `store`, the status XML is written afterwards.
pub fn register_for_disk(
    vm: &mut DomainObj,
    mut job: BlockJob,
    dst: Option<&str>,
    store: Option<&StatusStore>,
) -> Result<JobRef> {
    if let Some(dst) = dst {
        let disk = vm
            .def
            .disk(dst)
            .ok_or_else(|| BlockJobError::NotFound(format!("disk '{}'", dst)))?;

        if disk_has_active_job(vm, dst) {
            return Err(BlockJobError::OperationInvalid(format!(
                "disk '{}' already in active block job '{}'",
                dst,
                disk.private.blockjob.as_deref().unwrap_or_default()
            )));
        }

        let mirror = matches!(job.binding, JobBinding::Disk { mirror: true, .. });
        job.binding = JobBinding::Disk {
            dst: dst.to_string(),
            mirror,
        };
    }

    let handle = vm.private.blockjobs.insert(job)?;

    if let Some(dst) = dst {
        if let Some(disk) = vm.def.disk_mut(dst) {
            disk.private.blockjob = Some(handle.name().to_string());
        }
    }

    if let Some(store) = store {
        if let Err(e) = store.save_status(vm) {
            warn!(domain = %vm.def.name, error = %e, "Unable to save status after registering block job");
        }
    }

    info!(domain = %vm.def.name, job = %handle.name(), disk = ?dst, "Block job registered");
    Ok(handle)
}

/// Handle on the job bound to disk `dst`, if any.
pub fn get_by_disk(vm: &mut DomainObj, dst: &str) -> Option<JobRef> {
    let name = vm.def.disk(dst)?.private.blockjob.clone()?;
    vm.private.blockjobs.acquire(&name)
}

/// QEMU accepted the job.
pub fn mark_started(vm: &mut DomainObj, job: &JobRef) {
    if let Some(job) = vm.private.blockjobs.get_mut(job.name()) {
        if job.state == BlockJobState::New {
            job.state = BlockJobState::Running;
        }
        debug!(job = %job.name, "Block job started");
    }
}

/// Finish the startup sequence of a job.
///
/// A job that was never started is unbound from its disk, removed from
/// the registry and returned in reset form. A started job only loses the
/// caller's handle and `None` is returned.
pub fn startup_finalize(vm: &mut DomainObj, job: JobRef) -> Option<BlockJob> {
    let started = vm.private.blockjobs.get(job.name())?.is_started();

    if started {
        vm.private.blockjobs.release(job);
        return None;
    }

    debug!(job = %job.name(), "Discarding block job that never started");
    unbind_disk(vm, job.name());
    let mut removed = vm.private.blockjobs.remove(job.name())?;
    removed.reset();
    Some(removed)
}

/// Clear the job slot of whichever disk refers to `name`.
pub(crate) fn unbind_disk(vm: &mut DomainObj, name: &str) {
    for disk in vm.def.disks.iter_mut() {
        if disk.private.blockjob.as_deref() == Some(name) {
            disk.private.blockjob = None;
        }
    }
}

/// Whether disk `dst` has a job that blocks new ones.
pub fn disk_has_active_job(vm: &DomainObj, dst: &str) -> bool {
    vm.def
        .disk(dst)
        .and_then(|d| d.private.blockjob.as_deref())
        .and_then(|name| vm.private.blockjobs.get(name))
        .map(|job| job.is_active())
        .unwrap_or(false)
}

/// Whether any disk of the domain has an active job.
///
/// With `copy_only`, only copy jobs (tracked through the disk mirror)
/// count.
pub fn has_active_job(vm: &DomainObj, copy_only: bool) -> bool {
    vm.def.disks.iter().any(|disk| {
        if !copy_only && disk_has_active_job(vm, &disk.dst) {
            return true;
        }
        disk.mirror.is_some() && disk.mirror_job == BlockJobType::Copy
    })
}
