//! Shared driver state handed to block job processing.

use std::sync::Arc;

use tracing::info;

use crate::config::DriverConfig;
use crate::error::Result;
use crate::events::{EventQueue, EventSink};
use crate::lock::{LockManagerPlugin, ResourceLockCoordinator};
use crate::prober::{ChainProber, QemuImgProber};
use crate::status::StatusStore;

/// Collaborators shared by all domains of the driver.
pub struct DriverContext {
    pub config: DriverConfig,
    pub locks: ResourceLockCoordinator,
    pub store: StatusStore,
    pub events: Arc<dyn EventSink>,
    pub prober: Arc<dyn ChainProber>,
}

impl DriverContext {
    /// Build the context described by `config`.
    pub fn new(config: DriverConfig) -> Result<Self> {
        let plugin = LockManagerPlugin::new(&config.lock_manager)?;
        info!(
            lock_manager = %plugin.name(),
            state_dir = %config.state_dir.display(),
            "Block job driver initialized"
        );

        Ok(Self {
            locks: ResourceLockCoordinator::new(plugin),
            store: StatusStore::from_config(&config),
            events: Arc::new(EventQueue::with_capacity(config.event_queue_capacity)),
            prober: Arc::new(QemuImgProber::new().with_qemu_img(config.qemu_img_path.clone())),
            config,
        })
    }

    pub fn with_lock_plugin(mut self, plugin: LockManagerPlugin) -> Self {
        self.locks = ResourceLockCoordinator::new(plugin);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_prober(mut self, prober: Arc<dyn ChainProber>) -> Self {
        self.prober = prober;
        self
    }

    pub fn with_store(mut self, store: StatusStore) -> Self {
        self.store = store;
        self
    }

    /// Connection URI passed to the lock manager.
    pub fn uri(&self) -> &str {
        &self.config.uri
    }
}

impl std::fmt::Debug for DriverContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverContext")
            .field("config", &self.config)
            .field("locks", &self.locks)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}
