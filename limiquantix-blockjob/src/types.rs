//! Type definitions for domains, disks and storage sources.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// STORAGE SOURCES
// =============================================================================

/// Type of storage backing one chain layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Empty placeholder (chain terminator or ejected media)
    #[default]
    None,
    File,
    Block,
    Dir,
    Network,
    Volume,
    Nvme,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::None => "none",
            StorageType::File => "file",
            StorageType::Block => "block",
            StorageType::Dir => "dir",
            StorageType::Network => "network",
            StorageType::Volume => "volume",
            StorageType::Nvme => "nvme",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(StorageType::None),
            "file" => Some(StorageType::File),
            "block" => Some(StorageType::Block),
            "dir" => Some(StorageType::Dir),
            "network" => Some(StorageType::Network),
            "volume" => Some(StorageType::Volume),
            "nvme" => Some(StorageType::Nvme),
            _ => None,
        }
    }
}

/// On-disk image format of one chain layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageFormat {
    /// Not known yet (probed later)
    #[default]
    Auto,
    Raw,
    Qcow2,
    Qed,
    Vmdk,
    Luks,
}

impl StorageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageFormat::Auto => "auto",
            StorageFormat::Raw => "raw",
            StorageFormat::Qcow2 => "qcow2",
            StorageFormat::Qed => "qed",
            StorageFormat::Vmdk => "vmdk",
            StorageFormat::Luks => "luks",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(StorageFormat::Auto),
            "raw" => Some(StorageFormat::Raw),
            "qcow2" => Some(StorageFormat::Qcow2),
            "qed" => Some(StorageFormat::Qed),
            "vmdk" => Some(StorageFormat::Vmdk),
            "luks" => Some(StorageFormat::Luks),
            _ => None,
        }
    }
}

/// PCI address and namespace of an NVMe passthrough disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvmeAddress {
    pub domain: u16,
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
    pub namespace: u32,
    /// Detach from the host driver automatically
    pub managed: bool,
}

impl NvmeAddress {
    /// PCI address in `dddd:bb:ss.f` notation.
    pub fn pci_address(&self) -> String {
        format!(
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.slot, self.function
        )
    }
}

/// Per-layer side data created lazily while the layer is in use.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourcePrivate {
    /// Alias of the authentication secret object
    pub secinfo: Option<String>,
    /// Alias of the encryption secret object
    pub encinfo: Option<String>,
}

/// One layer of a disk backing chain.
///
/// Each layer exclusively owns its immediate backing layer. A chain that is
/// fully known ends in an empty placeholder layer (`StorageType::None`);
/// `backing_store == None` means the backing chain was not probed yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageSource {
    pub storage_type: StorageType,
    pub path: Option<String>,
    /// Network protocol (nbd, rbd, iscsi, ...) for network sources
    pub protocol: Option<String>,
    pub format: StorageFormat,
    /// Node name of the protocol/storage layer
    pub node_storage: Option<String>,
    /// Node name of the format layer
    pub node_format: Option<String>,
    pub readonly: bool,
    pub shared: bool,
    /// Index of the layer within the chain (0 = unassigned)
    pub id: u32,
    pub nvme: Option<NvmeAddress>,
    pub backing_store: Option<Box<StorageSource>>,
    pub private: Option<SourcePrivate>,
}

impl StorageSource {
    /// The chain terminator.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A local file image.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            storage_type: StorageType::File,
            path: Some(path.into()),
            ..Default::default()
        }
    }

    /// A host block device.
    pub fn block(path: impl Into<String>) -> Self {
        Self {
            storage_type: StorageType::Block,
            path: Some(path.into()),
            ..Default::default()
        }
    }

    /// A network image (`protocol` + `name`).
    pub fn network(protocol: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            storage_type: StorageType::Network,
            protocol: Some(protocol.into()),
            path: Some(name.into()),
            ..Default::default()
        }
    }

    /// An NVMe passthrough namespace.
    pub fn nvme(address: NvmeAddress) -> Self {
        Self {
            storage_type: StorageType::Nvme,
            nvme: Some(address),
            ..Default::default()
        }
    }

    /// Set the image format.
    pub fn with_format(mut self, format: StorageFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the node names used once the layer is realized in QEMU.
    pub fn with_node_names(mut self, storage: impl Into<String>, format: impl Into<String>) -> Self {
        self.node_storage = Some(storage.into());
        self.node_format = Some(format.into());
        self
    }

    /// Set the immediate backing layer.
    pub fn with_backing(mut self, backing: StorageSource) -> Self {
        self.backing_store = Some(Box::new(backing));
        self
    }

    /// Mark the layer read-only.
    pub fn with_readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    /// True for the empty placeholder layer.
    pub fn is_empty(&self) -> bool {
        match self.storage_type {
            StorageType::None => true,
            StorageType::Nvme => self.nvme.is_none(),
            StorageType::Network => false,
            _ => self.path.is_none(),
        }
    }

    /// True for a layer that carries data (anything but the terminator).
    pub fn is_backing(&self) -> bool {
        self.storage_type != StorageType::None
    }

    /// Type after resolving storage pool volumes (which live on files).
    pub fn actual_type(&self) -> StorageType {
        match self.storage_type {
            StorageType::Volume => StorageType::File,
            other => other,
        }
    }

    /// Whether the image is reachable through the host filesystem.
    pub fn is_local(&self) -> bool {
        matches!(
            self.actual_type(),
            StorageType::File | StorageType::Block | StorageType::Dir
        )
    }

    /// Private side data, created on first use.
    pub fn private_mut(&mut self) -> &mut SourcePrivate {
        self.private.get_or_insert_with(SourcePrivate::default)
    }

    /// Iterate over this layer and its backing layers, terminator excluded.
    pub fn chain(&self) -> ChainIter<'_> {
        ChainIter { next: Some(self) }
    }

    /// Human-readable identifier for log messages.
    pub fn describe(&self) -> String {
        match (&self.storage_type, &self.path, &self.nvme) {
            (StorageType::Network, Some(name), _) => format!(
                "{}://{}",
                self.protocol.as_deref().unwrap_or("network"),
                name
            ),
            (StorageType::Nvme, _, Some(addr)) => {
                format!("nvme://{}/{}", addr.pci_address(), addr.namespace)
            }
            (_, Some(path), _) => path.clone(),
            _ => "<empty>".to_string(),
        }
    }
}

/// Iterator over the data-carrying layers of a chain.
pub struct ChainIter<'a> {
    next: Option<&'a StorageSource>,
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = &'a StorageSource;

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.next.take()?;
        if !cur.is_backing() {
            return None;
        }
        self.next = cur.backing_store.as_deref();
        Some(cur)
    }
}

// =============================================================================
// BLOCK JOB ENUMS SHARED WITH DISKS
// =============================================================================

/// Kind of block job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockJobType {
    /// No job / job slot was reset
    #[default]
    Unknown,
    Pull,
    Copy,
    Commit,
    ActiveCommit,
    Backup,
    Internal,
    Create,
    /// Reconstructed from persisted state that could not be understood
    Broken,
}

impl BlockJobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockJobType::Unknown => "",
            BlockJobType::Pull => "pull",
            BlockJobType::Copy => "copy",
            BlockJobType::Commit => "commit",
            BlockJobType::ActiveCommit => "active-commit",
            BlockJobType::Backup => "backup",
            BlockJobType::Internal => "internal",
            BlockJobType::Create => "create",
            BlockJobType::Broken => "broken",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "" => Some(BlockJobType::Unknown),
            "pull" => Some(BlockJobType::Pull),
            "copy" => Some(BlockJobType::Copy),
            "commit" => Some(BlockJobType::Commit),
            "active-commit" => Some(BlockJobType::ActiveCommit),
            "backup" => Some(BlockJobType::Backup),
            "internal" => Some(BlockJobType::Internal),
            "create" => Some(BlockJobType::Create),
            "broken" => Some(BlockJobType::Broken),
            _ => None,
        }
    }
}

/// Mirror phase of a disk taking part in a two-phase (copy/active-commit) job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskMirrorState {
    #[default]
    None,
    /// Abort requested
    Abort,
    /// Mirror is in sync, ready to pivot
    Ready,
    /// Pivot requested
    Pivot,
}

impl DiskMirrorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskMirrorState::None => "none",
            DiskMirrorState::Abort => "abort",
            DiskMirrorState::Ready => "ready",
            DiskMirrorState::Pivot => "pivot",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(DiskMirrorState::None),
            "abort" => Some(DiskMirrorState::Abort),
            "ready" | "yes" => Some(DiskMirrorState::Ready),
            "pivot" => Some(DiskMirrorState::Pivot),
            _ => None,
        }
    }
}

// =============================================================================
// DOMAIN DEFINITION
// =============================================================================

/// Per-disk runtime data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskPrivate {
    /// Name of the block job currently bound to this disk
    pub blockjob: Option<String>,
    /// Disk is being migrated with NBD storage migration
    pub migrating: bool,
    /// Source override used for NBD storage migration
    pub migr_source: Option<StorageSource>,
}

/// A disk of a domain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskDef {
    /// Target device name (vda, sdb, ...)
    pub dst: String,
    pub src: StorageSource,
    /// Destination of a copy / active-commit job
    pub mirror: Option<StorageSource>,
    pub mirror_state: DiskMirrorState,
    pub mirror_job: BlockJobType,
    pub private: DiskPrivate,
}

impl DiskDef {
    pub fn new(dst: impl Into<String>, src: StorageSource) -> Self {
        Self {
            dst: dst.into(),
            src,
            ..Default::default()
        }
    }
}

/// A lock lease held for the domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseDef {
    pub lockspace: Option<String>,
    pub key: String,
    pub path: String,
    pub offset: u64,
}

/// Model of a memory device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryModel {
    #[default]
    Dimm,
    Nvdimm,
}

/// A memory device (only NVDIMM devices carry a backing file).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemoryDef {
    pub model: MemoryModel,
    pub nvdimm_path: Option<String>,
}

/// Boot-related files that need metadata locking.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OsDef {
    pub nvram: Option<String>,
    pub kernel: Option<String>,
    pub initrd: Option<String>,
    pub dtb: Option<String>,
    pub slic_table: Option<String>,
}

/// What to do with the domain when a lock is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockFailureAction {
    #[default]
    Default,
    Poweroff,
    Restart,
    Pause,
    Ignore,
}

impl LockFailureAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockFailureAction::Default => "default",
            LockFailureAction::Poweroff => "poweroff",
            LockFailureAction::Restart => "restart",
            LockFailureAction::Pause => "pause",
            LockFailureAction::Ignore => "ignore",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "default" => Some(LockFailureAction::Default),
            "poweroff" => Some(LockFailureAction::Poweroff),
            "restart" => Some(LockFailureAction::Restart),
            "pause" => Some(LockFailureAction::Pause),
            "ignore" => Some(LockFailureAction::Ignore),
            _ => None,
        }
    }
}

/// The subset of a domain definition this crate works with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainDef {
    pub name: String,
    pub uuid: Uuid,
    /// Runtime id (-1 when inactive)
    pub id: i32,
    pub disks: Vec<DiskDef>,
    pub leases: Vec<LeaseDef>,
    pub mems: Vec<MemoryDef>,
    pub os: OsDef,
    pub on_lock_failure: LockFailureAction,
}

impl DomainDef {
    /// Create a new definition with a random UUID.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: Uuid::new_v4(),
            id: -1,
            disks: Vec::new(),
            leases: Vec::new(),
            mems: Vec::new(),
            os: OsDef::default(),
            on_lock_failure: LockFailureAction::Default,
        }
    }

    /// Add a disk.
    pub fn with_disk(mut self, disk: DiskDef) -> Self {
        self.disks.push(disk);
        self
    }

    /// Add a lease.
    pub fn with_lease(mut self, lease: LeaseDef) -> Self {
        self.leases.push(lease);
        self
    }

    pub fn disk(&self, dst: &str) -> Option<&DiskDef> {
        self.disks.iter().find(|d| d.dst == dst)
    }

    pub fn disk_mut(&mut self, dst: &str) -> Option<&mut DiskDef> {
        self.disks.iter_mut().find(|d| d.dst == dst)
    }
}
