//! Monitor channel seam.
//!
//! The QEMU monitor protocol itself lives elsewhere; this crate only needs
//! the handful of commands below. Calls go through
//! [`crate::domain::Domain::enter_monitor`] so the domain lock is never held
//! while waiting for a reply.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One entry of `query-block-jobs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorJobInfo {
    /// Job id (the block job name)
    pub id: String,
    /// QEMU job type (stream, mirror, commit, backup, create)
    #[serde(rename = "type")]
    pub job_type: String,
    /// QEMU job status (running, ready, concluded, ...)
    pub status: String,
    pub offset: u64,
    pub len: u64,
    #[serde(default)]
    pub error: Option<String>,
}

/// One entry of `query-named-block-nodes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedBlockNode {
    #[serde(rename = "node-name")]
    pub node_name: String,
    /// Image file the node is backed by
    pub file: String,
    /// Driver of the node (qcow2, raw, file, host_device, ...)
    pub drv: String,
}

impl NamedBlockNode {
    /// Whether the node is a protocol (storage) layer rather than a
    /// format layer.
    pub fn is_protocol(&self) -> bool {
        matches!(self.drv.as_str(), "file" | "host_device" | "host_cdrom" | "nbd" | "rbd" | "iscsi" | "nvme")
    }
}

/// Monitor commands used by block job management.
#[async_trait]
pub trait Monitor: Send + Sync {
    /// List the block jobs QEMU currently knows about.
    async fn query_block_jobs(&self) -> Result<Vec<MonitorJobInfo>>;

    /// List the named nodes of the block graph.
    async fn query_named_block_nodes(&self) -> Result<Vec<NamedBlockNode>>;

    /// Finish a ready two-phase job by pivoting to the mirror.
    async fn block_job_complete(&self, job: &str) -> Result<()>;

    /// Cancel a job. With `force`, a ready mirror is abandoned without
    /// waiting for it to quiesce.
    async fn block_job_cancel(&self, job: &str, force: bool) -> Result<()>;

    /// Delete an internal snapshot from the image behind `device`.
    async fn delete_snapshot(&self, device: &str, snapshot: &str) -> Result<()>;
}
