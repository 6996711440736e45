//! Backing chain discovery.

use std::process::Command;

use serde::Deserialize;
use tracing::{debug, instrument};

use crate::chain::MAX_CHAIN_DEPTH;
use crate::error::{BlockJobError, Result};
use crate::types::{StorageFormat, StorageSource, StorageType};

/// Discovers the backing layers below an image.
pub trait ChainProber: Send + Sync {
    /// Return the backing chain of `top` (terminated), or `None` when the
    /// image cannot be inspected from the host.
    fn probe_backing(&self, top: &StorageSource) -> Result<Option<StorageSource>>;
}

/// Probes local images with `qemu-img info --backing-chain`.
#[derive(Debug, Clone)]
pub struct QemuImgProber {
    qemu_img_path: String,
}

#[derive(Debug, Deserialize)]
struct ImageInfo {
    filename: String,
    format: String,
}

impl QemuImgProber {
    pub fn new() -> Self {
        Self {
            qemu_img_path: "qemu-img".to_string(),
        }
    }

    /// Set the qemu-img binary path.
    pub fn with_qemu_img(mut self, path: impl Into<String>) -> Self {
        self.qemu_img_path = path.into();
        self
    }
}

impl Default for QemuImgProber {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainProber for QemuImgProber {
    #[instrument(skip(self, top), fields(image = %top.describe()))]
    fn probe_backing(&self, top: &StorageSource) -> Result<Option<StorageSource>> {
        let Some(path) = top.path.as_deref().filter(|_| top.is_local()) else {
            return Ok(None);
        };

        let output = Command::new(&self.qemu_img_path)
            .args(["info", "--backing-chain", "--output=json", "-U", path])
            .output()
            .map_err(|e| BlockJobError::Internal(format!("qemu-img info failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BlockJobError::Internal(format!(
                "qemu-img info failed for '{}': {}",
                path,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_backing_chain(&stdout).map(Some)
    }
}

/// Build the backing chain from `qemu-img info --backing-chain` JSON.
///
/// The first entry describes the top image itself and is skipped.
pub fn parse_backing_chain(json: &str) -> Result<StorageSource> {
    let images: Vec<ImageInfo> = serde_json::from_str(json)
        .map_err(|e| BlockJobError::Internal(format!("Failed to parse qemu-img output: {}", e)))?;

    if images.len() > MAX_CHAIN_DEPTH {
        return Err(BlockJobError::ChainTooDeep {
            disk: images
                .first()
                .map(|i| i.filename.clone())
                .unwrap_or_default(),
            max: MAX_CHAIN_DEPTH,
        });
    }

    let mut chain = StorageSource::empty();
    for image in images.iter().skip(1).rev() {
        let storage_type = if image.filename.starts_with("/dev/") {
            StorageType::Block
        } else {
            StorageType::File
        };
        let format = StorageFormat::parse(&image.format).unwrap_or(StorageFormat::Raw);

        chain = StorageSource {
            storage_type,
            path: Some(image.filename.clone()),
            format,
            readonly: true,
            backing_store: Some(Box::new(chain)),
            ..Default::default()
        };
    }

    debug!(layers = images.len().saturating_sub(1), "Parsed backing chain");
    Ok(chain)
}
