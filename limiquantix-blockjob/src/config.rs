//! Driver configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{BlockJobError, Result};
use crate::events::DEFAULT_CAPACITY;

/// Configuration of the block job driver.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Connection URI handed to the lock manager
    pub uri: String,
    /// Directory holding the status XML of running domains
    pub state_dir: PathBuf,
    /// Directory holding persistent domain definitions
    pub config_dir: PathBuf,
    /// Lock manager plugin name
    pub lock_manager: String,
    /// Number of domain events kept in memory
    pub event_queue_capacity: usize,
    /// Locked memory added per NVMe disk handed to the domain
    pub nvme_memlock_bytes_per_device: u64,
    /// qemu-img binary used for chain probing
    pub qemu_img_path: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            uri: "qemu:///system".to_string(),
            state_dir: PathBuf::from("/var/run/limiquantix/qemu"),
            config_dir: PathBuf::from("/etc/limiquantix/qemu"),
            lock_manager: "nop".to_string(),
            event_queue_capacity: DEFAULT_CAPACITY,
            nvme_memlock_bytes_per_device: 1024 * 1024 * 1024, // 1GiB
            qemu_img_path: "qemu-img".to_string(),
        }
    }
}

impl DriverConfig {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(BlockJobError::NotFound(format!(
                "config file {}",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| {
            BlockJobError::ConfigUnsupported(format!("Failed to parse config file: {}", e))
        })
    }

    /// Status file of a domain.
    pub fn status_path(&self, domain: &str) -> PathBuf {
        self.state_dir.join(format!("{}.xml", domain))
    }

    /// Persistent definition file of a domain.
    pub fn config_path(&self, domain: &str) -> PathBuf {
        self.config_dir.join(format!("{}.xml", domain))
    }
}
