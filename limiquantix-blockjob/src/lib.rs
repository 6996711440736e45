//! # limiquantix Block Job Core
//!
//! Lifecycle of QEMU block jobs and the disk backing chains they transform.
//!
//! ## Architecture
//!
//! ```text
//!  API call (attach, blockjob start/abort, snapshot)
//!        │
//!        ▼
//! ┌──────────────────────────────┐     ┌───────────────────────────┐
//! │ StorageSourceAccessManager   │────►│ ResourceLockCoordinator   │──► lock plugin
//! │ lock/nvme/namespace/label/   │     └───────────────────────────┘
//! │ cgroup grant and revoke      │
//! └──────────────┬───────────────┘
//!                ▼
//! ┌──────────────────────────────┐     ┌───────────────────────────┐
//! │ BlockJobRegistry             │◄────│ BlockJobEventProcessor    │◄── monitor events
//! │ (per domain, keyed by name)  │     │ mirror/pivot/unbind       │
//! └──────────────┬───────────────┘     └─────────────┬─────────────┘
//!                ▼                                   ▼
//!        status XML (StatusStore)             EventSink (DomainEvent)
//! ```
//!
//! All state of one domain lives in a [`DomainObj`] behind the per-domain
//! lock of [`Domain`]. Monitor calls release that lock while waiting.

pub mod access;
pub mod blockjob;
pub mod chain;
pub mod config;
pub mod domain;
pub mod driver;
pub mod error;
pub mod events;
pub mod lock;
pub mod mock;
pub mod monitor;
pub mod prober;
pub mod status;
pub mod types;

pub use access::{AccessFlags, AccessStep, StorageSourceAccessManager};
pub use blockjob::{
    BlockJob, BlockJobEventProcessor, BlockJobRegistry, BlockJobState, EventOutcome, JobBinding,
    JobPayload, JobRef,
};
pub use chain::MAX_CHAIN_DEPTH;
pub use config::DriverConfig;
pub use domain::{Domain, DomainObj, DomainState};
pub use driver::DriverContext;
pub use error::{BlockJobError, Result};
pub use events::{BlockJobStatus, DomainEvent, EventQueue, EventSink};
pub use lock::{LockManagerPlugin, ResourceLockCoordinator};
pub use monitor::Monitor;
pub use prober::{ChainProber, QemuImgProber};
pub use status::StatusStore;
pub use types::*;
