//! Lock manager plugin that grants everything.

use tracing::debug;

use crate::error::Result;
use crate::types::LockFailureAction;

use super::driver::{
    AcquireFlags, LockDriver, LockManager, LockObject, LockResource, NewManagerFlags,
};

/// Plugin used when no cross-host locking is configured.
#[derive(Debug, Default)]
pub struct NopLockDriver;

impl LockDriver for NopLockDriver {
    fn name(&self) -> &str {
        "nop"
    }

    fn new_manager(&self, object: &LockObject, _flags: NewManagerFlags) -> Result<Box<dyn LockManager>> {
        debug!(object = %object.name, params = ?object.params(), "Creating nop lock manager");
        Ok(Box::new(NopLockManager))
    }
}

struct NopLockManager;

impl LockManager for NopLockManager {
    fn add_resource(&mut self, _resource: LockResource) -> Result<()> {
        Ok(())
    }

    fn acquire(
        &mut self,
        _state: Option<&str>,
        _flags: AcquireFlags,
        _action: LockFailureAction,
    ) -> Result<Option<i32>> {
        Ok(None)
    }

    fn release(&mut self) -> Result<Option<String>> {
        Ok(None)
    }

    fn inquire(&mut self) -> Result<Option<String>> {
        Ok(None)
    }
}
