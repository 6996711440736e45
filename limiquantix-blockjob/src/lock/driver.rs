//! Lock manager plugin interface.
//!
//! A plugin provides cross-host mutual exclusion on named resources. For
//! every high-level operation a fresh [`LockManager`] is created for the
//! domain, resources are added to it, it acquires or releases them, and it
//! is dropped again. Nothing is shared between two operations.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{BlockJobError, Result};
use crate::types::LockFailureAction;

use super::nop::NopLockDriver;

/// Kind of object a lock manager instance is created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockObjectType {
    Domain,
}

/// Value of a typed lock parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockParamValue {
    Str(String),
    Uuid(Uuid),
    UInt(u32),
    ULong(u64),
}

impl fmt::Display for LockParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockParamValue::Str(s) => write!(f, "{}", s),
            LockParamValue::Uuid(u) => write!(f, "{}", u),
            LockParamValue::UInt(v) => write!(f, "{}", v),
            LockParamValue::ULong(v) => write!(f, "{}", v),
        }
    }
}

/// Named parameter passed to the plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockParam {
    pub key: &'static str,
    pub value: LockParamValue,
}

impl LockParam {
    pub fn new(key: &'static str, value: LockParamValue) -> Self {
        Self { key, value }
    }
}

/// Identity of the object that owns the locks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockObject {
    pub object_type: LockObjectType,
    pub uuid: Uuid,
    pub name: String,
    pub id: i32,
    pub pid: u32,
    pub uri: Option<String>,
}

impl LockObject {
    /// Parameters in the order the plugins expect them.
    pub fn params(&self) -> Vec<LockParam> {
        let mut params = vec![
            LockParam::new("uuid", LockParamValue::Uuid(self.uuid)),
            LockParam::new("name", LockParamValue::Str(self.name.clone())),
            LockParam::new("id", LockParamValue::UInt(self.id.max(0) as u32)),
            LockParam::new("pid", LockParamValue::UInt(self.pid)),
        ];
        if let Some(uri) = &self.uri {
            params.push(LockParam::new("uri", LockParamValue::Str(uri.clone())));
        }
        params
    }
}

/// Type of a lockable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockResourceType {
    Disk,
    Lease,
}

/// Access flags of a single resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceFlags {
    pub readonly: bool,
    pub shared: bool,
    /// Only bookkeeping is protected, no data access implied
    pub metadata: bool,
}

impl ResourceFlags {
    pub const METADATA: ResourceFlags = ResourceFlags {
        readonly: false,
        shared: false,
        metadata: true,
    };
}

/// A resource submitted to the lock manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockResource {
    pub resource_type: LockResourceType,
    pub name: String,
    pub params: Vec<LockParam>,
    pub flags: ResourceFlags,
}

/// Flags for [`LockManager::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AcquireFlags {
    /// Prevent further lock/unlock calls from the domain process
    pub restrict: bool,
    /// Register the process with the lock manager without acquiring yet
    pub register_only: bool,
}

/// Flags for [`LockDriver::new_manager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NewManagerFlags {
    /// The domain process is being started right now
    pub started: bool,
}

/// One lock manager instance, alive for a single operation.
///
/// Dropping the instance frees it without releasing anything.
pub trait LockManager: Send {
    /// Add a resource to the set acted upon by acquire/release.
    fn add_resource(&mut self, resource: LockResource) -> Result<()>;

    /// Acquire all added resources.
    ///
    /// Returns a file descriptor the process must keep open, if the plugin
    /// uses one.
    fn acquire(
        &mut self,
        state: Option<&str>,
        flags: AcquireFlags,
        action: LockFailureAction,
    ) -> Result<Option<i32>>;

    /// Release all added resources, returning opaque plugin state to
    /// carry across a pause.
    fn release(&mut self) -> Result<Option<String>>;

    /// Query the plugin state without changing it.
    fn inquire(&mut self) -> Result<Option<String>>;
}

/// A lock manager plugin.
pub trait LockDriver: Send + Sync {
    /// Plugin name (nop, lockd, sanlock, ...).
    fn name(&self) -> &str;

    /// Whether the plugin needs its state carried across pause/resume.
    fn uses_state(&self) -> bool {
        false
    }

    /// Create a manager instance for `object`.
    fn new_manager(&self, object: &LockObject, flags: NewManagerFlags) -> Result<Box<dyn LockManager>>;
}

/// A loaded lock manager plugin.
#[derive(Clone)]
pub struct LockManagerPlugin {
    driver: Arc<dyn LockDriver>,
}

impl LockManagerPlugin {
    /// Load a built-in plugin by name.
    pub fn new(name: &str) -> Result<Self> {
        match name {
            "nop" => Ok(Self::with_driver(Arc::new(NopLockDriver))),
            other => Err(BlockJobError::ConfigUnsupported(format!(
                "lock manager plugin '{}' is not available",
                other
            ))),
        }
    }

    /// Wrap an already constructed driver.
    pub fn with_driver(driver: Arc<dyn LockDriver>) -> Self {
        Self { driver }
    }

    pub fn name(&self) -> &str {
        self.driver.name()
    }

    pub fn uses_state(&self) -> bool {
        self.driver.uses_state()
    }

    pub fn driver(&self) -> &dyn LockDriver {
        self.driver.as_ref()
    }
}

impl fmt::Debug for LockManagerPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManagerPlugin")
            .field("name", &self.driver.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_lookup() {
        let plugin = LockManagerPlugin::new("nop").unwrap();
        assert_eq!(plugin.name(), "nop");
        assert!(!plugin.uses_state());

        let err = LockManagerPlugin::new("sanlock").unwrap_err();
        assert!(matches!(err, BlockJobError::ConfigUnsupported(_)));
    }

    #[test]
    fn test_object_params_skip_missing_uri() {
        let object = LockObject {
            object_type: LockObjectType::Domain,
            uuid: Uuid::nil(),
            name: "vm1".to_string(),
            id: -1,
            pid: 0,
            uri: None,
        };

        let keys: Vec<_> = object.params().iter().map(|p| p.key).collect();
        assert_eq!(keys, vec!["uuid", "name", "id", "pid"]);
    }
}
