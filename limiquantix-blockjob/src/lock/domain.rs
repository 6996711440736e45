//! Locking of domain resources during lifecycle and hot-plug operations.
//!
//! Every operation follows the same pattern: create a lock manager for the
//! domain, add the resources relevant to the call, acquire or release them,
//! drop the manager. Which resources get added is controlled by a
//! [`ResourceSet`]; an error while adding or acquiring drops the partially
//! built manager and returns that single error.

use tracing::{debug, instrument};

use crate::domain::DomainObj;
use crate::error::Result;
use crate::types::{DiskDef, LeaseDef, LockFailureAction, MemoryDef, MemoryModel, StorageSource, StorageType};

use super::driver::{
    AcquireFlags, LockManager, LockManagerPlugin, LockObject, LockObjectType, LockParam,
    LockParamValue, LockResource, LockResourceType, NewManagerFlags, ResourceFlags,
};

/// Which of the domain's resources a manager instance is populated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct ResourceSet {
    /// Leases and disk images, as needed to run the domain
    with_resources: bool,
    /// Disk images, memory backing files and boot files with metadata locks
    metadata_only: bool,
}

impl ResourceSet {
    const NONE: ResourceSet = ResourceSet {
        with_resources: false,
        metadata_only: false,
    };
    const ALL: ResourceSet = ResourceSet {
        with_resources: true,
        metadata_only: false,
    };
    const METADATA: ResourceSet = ResourceSet {
        with_resources: false,
        metadata_only: true,
    };
}

fn add_lease(lock: &mut dyn LockManager, lease: &LeaseDef) -> Result<()> {
    let mut params = vec![
        LockParam::new("path", LockParamValue::Str(lease.path.clone())),
        LockParam::new("offset", LockParamValue::ULong(lease.offset)),
    ];
    if let Some(lockspace) = &lease.lockspace {
        params.push(LockParam::new("lockspace", LockParamValue::Str(lockspace.clone())));
    }

    debug!(path = %lease.path, "Add lease");
    lock.add_resource(LockResource {
        resource_type: LockResourceType::Lease,
        name: lease.key.clone(),
        params,
        flags: ResourceFlags::default(),
    })
    .map_err(|e| {
        debug!(path = %lease.path, "Failed to add lease");
        e
    })
}

fn add_image(lock: &mut dyn LockManager, src: &StorageSource, metadata_only: bool) -> Result<()> {
    let Some(path) = &src.path else {
        return Ok(());
    };

    if !matches!(
        src.actual_type(),
        StorageType::Block | StorageType::File | StorageType::Dir
    ) {
        return Ok(());
    }

    let flags = if metadata_only {
        ResourceFlags::METADATA
    } else {
        ResourceFlags {
            readonly: src.readonly,
            shared: src.shared,
            metadata: false,
        }
    };

    debug!(path = %path, "Add disk");
    lock.add_resource(LockResource {
        resource_type: LockResourceType::Disk,
        name: path.clone(),
        params: Vec::new(),
        flags,
    })
    .map_err(|e| {
        debug!(path = %path, "Failed to add disk");
        e
    })
}

fn add_memory(lock: &mut dyn LockManager, mem: &MemoryDef) -> Result<()> {
    let path = match mem.model {
        MemoryModel::Nvdimm => mem.nvdimm_path.as_deref(),
        MemoryModel::Dimm => None,
    };

    match path {
        Some(path) => add_file(lock, Some(path)),
        None => Ok(()),
    }
}

fn add_file(lock: &mut dyn LockManager, file: Option<&str>) -> Result<()> {
    let Some(file) = file else {
        return Ok(());
    };

    debug!(file = %file, "Adding file");
    lock.add_resource(LockResource {
        resource_type: LockResourceType::Disk,
        name: file.to_string(),
        params: Vec::new(),
        flags: ResourceFlags::METADATA,
    })
}

/// Acquires and releases domain resources through a lock manager plugin.
#[derive(Debug, Clone)]
pub struct ResourceLockCoordinator {
    plugin: LockManagerPlugin,
}

impl ResourceLockCoordinator {
    pub fn new(plugin: LockManagerPlugin) -> Self {
        Self { plugin }
    }

    pub fn plugin(&self) -> &LockManagerPlugin {
        &self.plugin
    }

    fn new_manager(
        &self,
        uri: Option<&str>,
        dom: &DomainObj,
        set: ResourceSet,
        flags: NewManagerFlags,
    ) -> Result<Box<dyn LockManager>> {
        let def = &dom.def;
        let object = LockObject {
            object_type: LockObjectType::Domain,
            uuid: def.uuid,
            name: def.name.clone(),
            id: def.id,
            pid: dom.pid,
            uri: uri.map(str::to_string),
        };

        debug!(plugin = %self.plugin.name(), domain = %def.name, ?set, "Creating lock manager");
        let mut lock = self.plugin.driver().new_manager(&object, flags)?;

        if set.with_resources {
            debug!("Adding leases");
            for lease in &def.leases {
                add_lease(lock.as_mut(), lease)?;
            }
        }

        if set.with_resources || set.metadata_only {
            debug!("Adding disks");
            for disk in &def.disks {
                add_image(lock.as_mut(), &disk.src, set.metadata_only)?;
            }
        }

        if set.metadata_only {
            for mem in &def.mems {
                add_memory(lock.as_mut(), mem)?;
            }

            let os = &def.os;
            for file in [&os.nvram, &os.kernel, &os.initrd, &os.dtb, &os.slic_table] {
                add_file(lock.as_mut(), file.as_deref())?;
            }
        }

        Ok(lock)
    }

    /// Lock everything the domain needs before its process starts running.
    ///
    /// Returns the plugin's file descriptor for the new process, if any.
    #[instrument(skip(self, dom), fields(domain = %dom.def.name, paused = paused))]
    pub fn process_start(&self, uri: &str, dom: &DomainObj, paused: bool) -> Result<Option<i32>> {
        let mut lock = self.new_manager(
            Some(uri),
            dom,
            ResourceSet::ALL,
            NewManagerFlags { started: true },
        )?;

        let flags = AcquireFlags {
            restrict: true,
            register_only: paused,
        };

        lock.acquire(None, flags, dom.def.on_lock_failure)
    }

    /// Release all domain resources when its CPUs are paused.
    ///
    /// The returned state must be handed back to [`Self::process_resume`].
    /// Plugins that keep no state return `None`.
    #[instrument(skip(self, dom), fields(domain = %dom.def.name))]
    pub fn process_pause(&self, dom: &DomainObj) -> Result<Option<String>> {
        let mut lock = self.new_manager(None, dom, ResourceSet::ALL, NewManagerFlags::default())?;
        let state = lock.release()?;
        Ok(state.filter(|_| self.plugin.uses_state()))
    }

    /// Re-acquire all domain resources before its CPUs resume.
    #[instrument(skip(self, dom, state), fields(domain = %dom.def.name))]
    pub fn process_resume(&self, uri: &str, dom: &DomainObj, state: Option<&str>) -> Result<()> {
        let mut lock = self.new_manager(
            Some(uri),
            dom,
            ResourceSet::ALL,
            NewManagerFlags::default(),
        )?;
        let state = state.filter(|_| self.plugin.uses_state());
        lock.acquire(state, AcquireFlags::default(), dom.def.on_lock_failure)?;
        Ok(())
    }

    /// Ask the plugin for the current lock state of the domain.
    #[instrument(skip(self, dom), fields(domain = %dom.def.name))]
    pub fn process_inquire(&self, dom: &DomainObj) -> Result<Option<String>> {
        let mut lock = self.new_manager(None, dom, ResourceSet::ALL, NewManagerFlags::default())?;
        lock.inquire()
    }

    /// Lock a single image that is being hot-plugged.
    #[instrument(skip(self, dom, src), fields(domain = %dom.def.name, src = %src.describe()))]
    pub fn image_attach(&self, uri: &str, dom: &DomainObj, src: &StorageSource) -> Result<()> {
        let mut lock = self.new_manager(
            Some(uri),
            dom,
            ResourceSet::NONE,
            NewManagerFlags::default(),
        )?;
        add_image(lock.as_mut(), src, false)?;
        lock.acquire(None, AcquireFlags::default(), dom.def.on_lock_failure)?;
        Ok(())
    }

    pub fn disk_attach(&self, uri: &str, dom: &DomainObj, disk: &DiskDef) -> Result<()> {
        self.image_attach(uri, dom, &disk.src)
    }

    /// Unlock a single image that is being unplugged.
    #[instrument(skip(self, dom, src), fields(domain = %dom.def.name, src = %src.describe()))]
    pub fn image_detach(&self, dom: &DomainObj, src: &StorageSource) -> Result<()> {
        let mut lock = self.new_manager(None, dom, ResourceSet::NONE, NewManagerFlags::default())?;
        add_image(lock.as_mut(), src, false)?;
        lock.release()?;
        Ok(())
    }

    pub fn disk_detach(&self, dom: &DomainObj, disk: &DiskDef) -> Result<()> {
        self.image_detach(dom, &disk.src)
    }

    /// Acquire a lease that is being hot-plugged.
    #[instrument(skip(self, dom, lease), fields(domain = %dom.def.name, lease = %lease.key))]
    pub fn lease_attach(&self, uri: &str, dom: &DomainObj, lease: &LeaseDef) -> Result<()> {
        let mut lock = self.new_manager(
            Some(uri),
            dom,
            ResourceSet::NONE,
            NewManagerFlags::default(),
        )?;
        add_lease(lock.as_mut(), lease)?;
        lock.acquire(None, AcquireFlags::default(), dom.def.on_lock_failure)?;
        Ok(())
    }

    /// Release a lease that is being unplugged.
    #[instrument(skip(self, dom, lease), fields(domain = %dom.def.name, lease = %lease.key))]
    pub fn lease_detach(&self, dom: &DomainObj, lease: &LeaseDef) -> Result<()> {
        let mut lock = self.new_manager(None, dom, ResourceSet::NONE, NewManagerFlags::default())?;
        add_lease(lock.as_mut(), lease)?;
        lock.release()?;
        Ok(())
    }

    /// Take metadata locks on every file of the domain.
    ///
    /// Used around bookkeeping such as relabelling, which is valid even
    /// while the domain is not running.
    #[instrument(skip(self, dom), fields(domain = %dom.def.name))]
    pub fn metadata_lock(&self, dom: &DomainObj) -> Result<()> {
        let mut lock = self.new_manager(None, dom, ResourceSet::METADATA, NewManagerFlags::default())?;
        lock.acquire(None, AcquireFlags::default(), LockFailureAction::Default)?;
        Ok(())
    }

    #[instrument(skip(self, dom), fields(domain = %dom.def.name))]
    pub fn metadata_unlock(&self, dom: &DomainObj) -> Result<()> {
        let mut lock = self.new_manager(None, dom, ResourceSet::METADATA, NewManagerFlags::default())?;
        lock.release()?;
        Ok(())
    }

    /// Metadata lock on a single image.
    pub fn metadata_image_lock(&self, dom: &DomainObj, src: &StorageSource) -> Result<()> {
        let mut lock = self.new_manager(None, dom, ResourceSet::NONE, NewManagerFlags::default())?;
        add_image(lock.as_mut(), src, true)?;
        lock.acquire(None, AcquireFlags::default(), LockFailureAction::Default)?;
        Ok(())
    }

    pub fn metadata_image_unlock(&self, dom: &DomainObj, src: &StorageSource) -> Result<()> {
        let mut lock = self.new_manager(None, dom, ResourceSet::NONE, NewManagerFlags::default())?;
        add_image(lock.as_mut(), src, true)?;
        lock.release()?;
        Ok(())
    }

    /// Metadata lock on the backing file of a memory device.
    pub fn metadata_mem_lock(&self, dom: &DomainObj, mem: &MemoryDef) -> Result<()> {
        let mut lock = self.new_manager(None, dom, ResourceSet::NONE, NewManagerFlags::default())?;
        add_memory(lock.as_mut(), mem)?;
        lock.acquire(None, AcquireFlags::default(), LockFailureAction::Default)?;
        Ok(())
    }

    pub fn metadata_mem_unlock(&self, dom: &DomainObj, mem: &MemoryDef) -> Result<()> {
        let mut lock = self.new_manager(None, dom, ResourceSet::NONE, NewManagerFlags::default())?;
        add_memory(lock.as_mut(), mem)?;
        lock.release()?;
        Ok(())
    }
}
