//! Resource locking.
//!
//! - [`driver`]: the lock manager plugin interface
//! - [`nop`]: the default plugin that grants everything
//! - [`domain`]: [`ResourceLockCoordinator`], which decides which of a
//!   domain's resources each operation locks

pub mod domain;
pub mod driver;
pub mod nop;

pub use domain::ResourceLockCoordinator;
pub use driver::{
    AcquireFlags, LockDriver, LockManager, LockManagerPlugin, LockObject, LockObjectType, LockParam,
    LockParamValue, LockResource, LockResourceType, NewManagerFlags, ResourceFlags,
};
pub use nop::NopLockDriver;
