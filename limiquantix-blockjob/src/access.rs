//! Granting and revoking the hypervisor's access to storage.
//!
//! Before QEMU may open an image several subsystems have to agree: the lock
//! manager, NVMe passthrough (with the matching locked-memory limit), the
//! device namespace, the security label and the device cgroup. Grants go
//! through these in that order. Each completed step is recorded, and on
//! failure exactly the recorded steps are undone in reverse order.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::domain::DomainObj;
use crate::driver::DriverContext;
use crate::error::Result;
use crate::types::{NvmeAddress, StorageSource, StorageType};

/// Mandatory access control labelling of images.
pub trait SecurityManager: Send + Sync {
    /// Label `src` (and with `chain`, its whole backing chain) for use by
    /// the domain. `chain_top` marks `src` as the top of its chain.
    fn set_image_label(&self, vm: &DomainObj, src: &StorageSource, chain: bool, chain_top: bool) -> Result<()>;

    fn restore_image_label(&self, vm: &DomainObj, src: &StorageSource, chain: bool) -> Result<()>;
}

/// Device cgroup allow-list of the domain process.
pub trait CgroupManager: Send + Sync {
    fn setup_image(&self, vm: &DomainObj, src: &StorageSource) -> Result<()>;

    fn teardown_image(&self, vm: &DomainObj, src: &StorageSource) -> Result<()>;

    /// Allow every layer of the chain starting at `src`.
    fn setup_image_chain(&self, vm: &DomainObj, src: &StorageSource) -> Result<()> {
        for layer in src.chain() {
            self.setup_image(vm, layer)?;
        }
        Ok(())
    }

    /// Remove every layer of the chain starting at `src`.
    fn teardown_image_chain(&self, vm: &DomainObj, src: &StorageSource) -> Result<()> {
        for layer in src.chain() {
            self.teardown_image(vm, layer)?;
        }
        Ok(())
    }
}

/// Device nodes visible inside the domain's mount namespace.
pub trait NamespaceManager: Send + Sync {
    fn setup_disk(&self, vm: &DomainObj, src: &StorageSource) -> Result<()>;

    fn teardown_disk(&self, vm: &DomainObj, src: &StorageSource) -> Result<()>;
}

/// NVMe controller passthrough.
pub trait HostdevManager: Send + Sync {
    /// Detach the controllers from the host and reserve them for the domain.
    fn prepare_nvme(&self, vm: &DomainObj, devices: &[NvmeAddress]) -> Result<()>;

    fn release_nvme(&self, vm: &DomainObj, devices: &[NvmeAddress]) -> Result<()>;
}

/// Locked-memory limit of the domain process.
pub trait MemlockManager: Send + Sync {
    fn get_limit(&self, pid: u32) -> Result<u64>;

    fn set_limit(&self, pid: u32, bytes: u64) -> Result<()>;
}

/// Collaborator set that permits everything. Used where no confinement is
/// configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unconfined;

impl SecurityManager for Unconfined {
    fn set_image_label(&self, _vm: &DomainObj, _src: &StorageSource, _chain: bool, _chain_top: bool) -> Result<()> {
        Ok(())
    }

    fn restore_image_label(&self, _vm: &DomainObj, _src: &StorageSource, _chain: bool) -> Result<()> {
        Ok(())
    }
}

impl CgroupManager for Unconfined {
    fn setup_image(&self, _vm: &DomainObj, _src: &StorageSource) -> Result<()> {
        Ok(())
    }

    fn teardown_image(&self, _vm: &DomainObj, _src: &StorageSource) -> Result<()> {
        Ok(())
    }
}

impl NamespaceManager for Unconfined {
    fn setup_disk(&self, _vm: &DomainObj, _src: &StorageSource) -> Result<()> {
        Ok(())
    }

    fn teardown_disk(&self, _vm: &DomainObj, _src: &StorageSource) -> Result<()> {
        Ok(())
    }
}

impl HostdevManager for Unconfined {
    fn prepare_nvme(&self, _vm: &DomainObj, _devices: &[NvmeAddress]) -> Result<()> {
        Ok(())
    }

    fn release_nvme(&self, _vm: &DomainObj, _devices: &[NvmeAddress]) -> Result<()> {
        Ok(())
    }
}

impl MemlockManager for Unconfined {
    fn get_limit(&self, _pid: u32) -> Result<u64> {
        Ok(0)
    }

    fn set_limit(&self, _pid: u32, _bytes: u64) -> Result<()> {
        Ok(())
    }
}

/// Options of [`StorageSourceAccessManager::modify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessFlags {
    /// Operate on the whole backing chain instead of a single layer
    pub chain: bool,
    /// `src` is the top of its chain
    pub chain_top: bool,
    /// Leave completed steps in place when a later step fails
    pub skip_revoke: bool,
    /// Treat the image as read-only for this call
    pub force_readonly: bool,
    /// Treat the image as read-write for this call
    pub force_readwrite: bool,
    /// Only change the access mode of an image that is already in use
    pub modify_access: bool,
    /// Take access away instead of granting it
    pub revoke: bool,
}

/// One step of the grant protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStep {
    Lock,
    Nvme,
    Memlock,
    Namespace,
    Label,
    Cgroup,
}

impl AccessStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessStep::Lock => "lock",
            AccessStep::Nvme => "nvme",
            AccessStep::Memlock => "memlock",
            AccessStep::Namespace => "namespace",
            AccessStep::Label => "label",
            AccessStep::Cgroup => "cgroup",
        }
    }
}

impl fmt::Display for AccessStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Steps performed so far, in order, with what is needed to undo them.
#[derive(Debug, Default)]
struct Completed {
    steps: Vec<AccessStep>,
    /// Memlock limit before the bump, restored on unwind
    saved_memlock: Option<u64>,
}

impl Completed {
    fn push(&mut self, step: AccessStep) {
        debug!(step = %step, "Access step done");
        self.steps.push(step);
    }
}

/// Coordinates the grant/revoke protocol for storage sources.
pub struct StorageSourceAccessManager {
    ctx: Arc<DriverContext>,
    security: Arc<dyn SecurityManager>,
    cgroup: Arc<dyn CgroupManager>,
    namespace: Arc<dyn NamespaceManager>,
    hostdev: Arc<dyn HostdevManager>,
    memlock: Arc<dyn MemlockManager>,
}

impl StorageSourceAccessManager {
    /// Manager with unconfined collaborators.
    pub fn new(ctx: Arc<DriverContext>) -> Self {
        let unconfined = Arc::new(Unconfined);
        Self {
            ctx,
            security: unconfined.clone(),
            cgroup: unconfined.clone(),
            namespace: unconfined.clone(),
            hostdev: unconfined.clone(),
            memlock: unconfined,
        }
    }

    pub fn with_security(mut self, security: Arc<dyn SecurityManager>) -> Self {
        self.security = security;
        self
    }

    pub fn with_cgroup(mut self, cgroup: Arc<dyn CgroupManager>) -> Self {
        self.cgroup = cgroup;
        self
    }

    pub fn with_namespace(mut self, namespace: Arc<dyn NamespaceManager>) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn with_hostdev(mut self, hostdev: Arc<dyn HostdevManager>) -> Self {
        self.hostdev = hostdev;
        self
    }

    pub fn with_memlock(mut self, memlock: Arc<dyn MemlockManager>) -> Self {
        self.memlock = memlock;
        self
    }

    /// Grant access to a single chain element.
    ///
    /// Without `new_source` the image is already in use and only its access
    /// mode changes.
    pub fn allow(
        &self,
        vm: &DomainObj,
        src: &StorageSource,
        readonly: bool,
        new_source: bool,
        chain_top: bool,
    ) -> Result<()> {
        let flags = AccessFlags {
            force_readonly: readonly,
            modify_access: !new_source,
            chain_top,
            ..Default::default()
        };
        self.modify(vm, src, flags)
    }

    /// Revoke access to a single chain element.
    pub fn revoke(&self, vm: &DomainObj, src: &StorageSource) {
        let flags = AccessFlags {
            revoke: true,
            ..Default::default()
        };
        // revocation never fails, problems are logged per step
        let _ = self.modify(vm, src, flags);
    }

    /// Grant access to the whole chain starting at `src`.
    pub fn allow_chain(&self, vm: &DomainObj, src: &StorageSource) -> Result<()> {
        let flags = AccessFlags {
            chain: true,
            ..Default::default()
        };
        self.modify(vm, src, flags)
    }

    /// Revoke access to the whole chain starting at `src`.
    pub fn revoke_chain(&self, vm: &DomainObj, src: &StorageSource) {
        let flags = AccessFlags {
            chain: true,
            revoke: true,
            ..Default::default()
        };
        let _ = self.modify(vm, src, flags);
    }

    /// Run the grant protocol, or with `flags.revoke` the full teardown.
    ///
    /// `src` is never modified; forced access modes apply to a working copy
    /// for the duration of the call.
    #[instrument(skip(self, vm, src), fields(domain = %vm.def.name, src = %src.describe()))]
    pub fn modify(&self, vm: &DomainObj, src: &StorageSource, flags: AccessFlags) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }

        let mut effective = src.clone();
        if flags.force_readonly {
            effective.readonly = true;
        }
        if flags.force_readwrite {
            effective.readonly = false;
        }

        if flags.revoke {
            let mut all = Completed::default();
            if !flags.modify_access {
                all.steps.extend([AccessStep::Lock, AccessStep::Nvme]);
                if !self.nvme_devices(&effective, flags.chain).is_empty() {
                    all.steps.push(AccessStep::Memlock);
                }
                all.steps.push(AccessStep::Namespace);
            }
            all.steps.extend([AccessStep::Label, AccessStep::Cgroup]);
            self.unwind(vm, &effective, flags, all);
            return Ok(());
        }

        let mut done = Completed::default();
        match self.grant(vm, &effective, flags, &mut done) {
            Ok(()) => {
                info!(chain = flags.chain, readonly = effective.readonly, "Storage access granted");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Granting storage access failed");
                if flags.skip_revoke {
                    debug!("Leaving completed access steps in place");
                } else {
                    self.unwind(vm, &effective, flags, done);
                }
                Err(e)
            }
        }
    }

    fn nvme_devices(&self, src: &StorageSource, chain: bool) -> Vec<NvmeAddress> {
        let layers: Box<dyn Iterator<Item = &StorageSource>> = if chain {
            Box::new(src.chain())
        } else {
            Box::new(std::iter::once(src))
        };
        layers
            .filter(|l| l.storage_type == StorageType::Nvme)
            .filter_map(|l| l.nvme.clone())
            .collect()
    }

    fn grant(&self, vm: &DomainObj, src: &StorageSource, flags: AccessFlags, done: &mut Completed) -> Result<()> {
        if !flags.modify_access {
            self.ctx.locks.image_attach(self.ctx.uri(), vm, src)?;
            done.push(AccessStep::Lock);

            let nvme = self.nvme_devices(src, flags.chain);
            if !nvme.is_empty() {
                self.hostdev.prepare_nvme(vm, &nvme)?;
                done.push(AccessStep::Nvme);

                let current = self.memlock.get_limit(vm.pid)?;
                let bump = self.ctx.config.nvme_memlock_bytes_per_device * nvme.len() as u64;
                self.memlock.set_limit(vm.pid, current.saturating_add(bump))?;
                done.saved_memlock = Some(current);
                done.push(AccessStep::Memlock);
            }

            self.namespace.setup_disk(vm, src)?;
            done.push(AccessStep::Namespace);
        }

        self.security.set_image_label(vm, src, flags.chain, flags.chain_top)?;
        done.push(AccessStep::Label);

        if flags.chain {
            self.cgroup.setup_image_chain(vm, src)?;
        } else {
            self.cgroup.setup_image(vm, src)?;
        }
        done.push(AccessStep::Cgroup);

        Ok(())
    }

    /// Undo `done` in reverse order, logging failures.
    fn unwind(&self, vm: &DomainObj, src: &StorageSource, flags: AccessFlags, done: Completed) {
        let nvme = self.nvme_devices(src, flags.chain);

        for step in done.steps.iter().rev() {
            let result = match step {
                AccessStep::Cgroup if flags.chain => self.cgroup.teardown_image_chain(vm, src),
                AccessStep::Cgroup => self.cgroup.teardown_image(vm, src),
                AccessStep::Label => self.security.restore_image_label(vm, src, flags.chain),
                AccessStep::Namespace => self.namespace.teardown_disk(vm, src),
                AccessStep::Memlock => self.restore_memlock(vm, done.saved_memlock, nvme.len()),
                AccessStep::Nvme if nvme.is_empty() => Ok(()),
                AccessStep::Nvme => self.hostdev.release_nvme(vm, &nvme),
                AccessStep::Lock => self.ctx.locks.image_detach(vm, src),
            };

            match result {
                Ok(()) => debug!(step = %step, "Access step undone"),
                Err(e) => warn!(step = %step, error = %e, "Unable to undo storage access step"),
            }
        }
    }

    fn restore_memlock(&self, vm: &DomainObj, saved: Option<u64>, devices: usize) -> Result<()> {
        let limit = match saved {
            Some(limit) => limit,
            None => {
                let bump = self.ctx.config.nvme_memlock_bytes_per_device * devices as u64;
                self.memlock.get_limit(vm.pid)?.saturating_sub(bump)
            }
        };
        self.memlock.set_limit(vm.pid, limit)
    }
}

impl fmt::Debug for StorageSourceAccessManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageSourceAccessManager")
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::domain::DomainState;
    use crate::error::BlockJobError;
    use crate::lock::LockManagerPlugin;
    use crate::mock::{AccessCall, RecordingAccess, RecordingLockDriver};
    use crate::types::DomainDef;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn setup() -> (StorageSourceAccessManager, Arc<RecordingAccess>, Arc<RecordingLockDriver>, DomainObj) {
        let locks = Arc::new(RecordingLockDriver::new());
        let ctx = DriverContext::new(DriverConfig::default())
            .unwrap()
            .with_lock_plugin(LockManagerPlugin::with_driver(locks.clone()));
        let access = Arc::new(RecordingAccess::new().with_memlock_limit(64 * 1024));
        let mgr = StorageSourceAccessManager::new(Arc::new(ctx))
            .with_security(access.clone())
            .with_cgroup(access.clone())
            .with_namespace(access.clone())
            .with_hostdev(access.clone())
            .with_memlock(access.clone());

        let mut vm = DomainObj::new(DomainDef::new("vm1"));
        vm.state = DomainState::Running;
        vm.pid = 4242;
        (mgr, access, locks, vm)
    }

    fn nvme_disk() -> StorageSource {
        StorageSource::nvme(NvmeAddress {
            domain: 0,
            bus: 1,
            slot: 0,
            function: 0,
            namespace: 1,
            managed: true,
        })
    }

    #[test]
    fn test_grant_order_for_file_image() {
        let (mgr, access, locks, vm) = setup();
        let src = StorageSource::file("/img/new.qcow2");

        mgr.allow(&vm, &src, false, true, true).unwrap();

        assert_eq!(
            access.calls(),
            vec![
                AccessCall::SetupNamespace("/img/new.qcow2".to_string()),
                AccessCall::SetLabel {
                    path: "/img/new.qcow2".to_string(),
                    chain: false,
                    chain_top: true
                },
                AccessCall::SetupCgroup("/img/new.qcow2".to_string()),
            ]
        );
        assert!(locks.held().contains("/img/new.qcow2"));
    }

    #[test]
    fn test_nvme_cgroup_failure_unwinds_in_reverse() {
        let (mgr, access, locks, vm) = setup();
        access.fail_on("setup_cgroup");
        let src = nvme_disk();

        let err = mgr.allow(&vm, &src, false, true, false).unwrap_err();
        assert!(matches!(err, BlockJobError::Cgroup(_)));

        let desc = src.describe();
        assert_eq!(
            access.calls(),
            vec![
                AccessCall::PrepareNvme(1),
                AccessCall::GetMemlock,
                AccessCall::SetMemlock(64 * 1024 + GIB),
                AccessCall::SetupNamespace(desc.clone()),
                AccessCall::SetLabel {
                    path: desc.clone(),
                    chain: false,
                    chain_top: false
                },
                AccessCall::SetupCgroup(desc.clone()),
                AccessCall::RestoreLabel {
                    path: desc.clone(),
                    chain: false
                },
                AccessCall::TeardownNamespace(desc),
                AccessCall::SetMemlock(64 * 1024),
                AccessCall::ReleaseNvme(1),
            ]
        );
        assert!(locks.held().is_empty());
        assert!(!access.calls().iter().any(|c| matches!(c, AccessCall::TeardownCgroup(_))));
    }

    #[test]
    fn test_skip_revoke_leaves_steps_in_place() {
        let (mgr, access, locks, vm) = setup();
        access.fail_on("set_label");
        let src = StorageSource::file("/img/new.qcow2");
        let flags = AccessFlags {
            skip_revoke: true,
            ..Default::default()
        };

        assert!(mgr.modify(&vm, &src, flags).is_err());
        assert!(!access
            .calls()
            .iter()
            .any(|c| matches!(c, AccessCall::TeardownNamespace(_))));
        assert!(locks.held().contains("/img/new.qcow2"));
    }

    #[test]
    fn test_modify_access_only_relabels() {
        let (mgr, access, locks, vm) = setup();
        let src = nvme_disk();

        mgr.allow(&vm, &src, true, false, false).unwrap();

        let calls = access.calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(calls[0], AccessCall::SetLabel { .. }));
        assert!(matches!(calls[1], AccessCall::SetupCgroup(_)));
        assert!(locks.added_resources().is_empty());
    }

    #[test]
    fn test_forced_readonly_does_not_leak() {
        let (mgr, access, _locks, vm) = setup();
        let src = StorageSource::file("/img/base.qcow2");

        mgr.allow(&vm, &src, true, true, false).unwrap();
        assert!(!src.readonly);
        assert_eq!(access.last_label_readonly(), Some(true));
    }

    #[test]
    fn test_revoke_chain_runs_all_steps_best_effort() {
        let (mgr, access, locks, vm) = setup();
        let chain = StorageSource::file("/img/top.qcow2")
            .with_backing(StorageSource::file("/img/base.qcow2").with_backing(StorageSource::empty()));

        mgr.allow_chain(&vm, &chain).unwrap();
        assert_eq!(
            access
                .calls()
                .iter()
                .filter(|c| matches!(c, AccessCall::SetupCgroup(_)))
                .count(),
            2
        );

        access.clear();
        access.fail_on("restore_label");
        mgr.revoke_chain(&vm, &chain);

        let calls = access.calls();
        assert_eq!(
            calls,
            vec![
                AccessCall::TeardownCgroup("/img/top.qcow2".to_string()),
                AccessCall::TeardownCgroup("/img/base.qcow2".to_string()),
                AccessCall::RestoreLabel {
                    path: "/img/top.qcow2".to_string(),
                    chain: true
                },
                AccessCall::TeardownNamespace("/img/top.qcow2".to_string()),
            ]
        );
        assert!(locks.held().is_empty());
    }

    #[test]
    fn test_empty_source_is_ignored() {
        let (mgr, access, locks, vm) = setup();
        mgr.allow(&vm, &StorageSource::empty(), false, true, false).unwrap();
        assert!(access.calls().is_empty());
        assert!(locks.calls().is_empty());
    }
}
