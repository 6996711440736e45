//! Error types for block job and disk access management.

use thiserror::Error;

/// Errors that can occur while managing block jobs, locks and disk access.
#[derive(Error, Debug)]
pub enum BlockJobError {
    /// The request is not valid in the current state (admission error).
    #[error("Operation not valid: {0}")]
    OperationInvalid(String),

    /// The domain is not running.
    #[error("Domain is not running: {0}")]
    DomainNotRunning(String),

    /// The domain process went away while we were talking to it.
    #[error("Domain '{0}' is no longer running")]
    DomainExited(String),

    /// A named object (disk, job, lease) was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The lock manager refused or failed a request.
    #[error("Lock manager failure: {0}")]
    LockFailed(String),

    /// Applying or restoring a security label failed.
    #[error("Security label failure: {0}")]
    Security(String),

    /// Device cgroup allow-list setup or teardown failed.
    #[error("Cgroup failure: {0}")]
    Cgroup(String),

    /// Device namespace setup or teardown failed.
    #[error("Namespace failure: {0}")]
    Namespace(String),

    /// Host device (NVMe) reservation failed.
    #[error("Host device failure: {0}")]
    Hostdev(String),

    /// Adjusting the locked memory limit failed.
    #[error("Memory lock limit failure: {0}")]
    Memlock(String),

    /// Backing chain would exceed the supported depth.
    #[error("backing chains more than {max} layers deep are not supported for disk '{disk}'")]
    ChainTooDeep { disk: String, max: usize },

    /// Monitor channel failure.
    #[error("Monitor error: {0}")]
    Monitor(String),

    /// Status XML could not be formatted or parsed.
    #[error("XML error: {0}")]
    Xml(String),

    /// Filesystem error while persisting or loading state.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unsupported configuration (e.g. unknown lock manager plugin).
    #[error("Unsupported configuration: {0}")]
    ConfigUnsupported(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BlockJobError {
    /// Whether the error means the domain object must be fully reconciled
    /// before it can be used again.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BlockJobError::DomainExited(_))
    }
}

impl From<quick_xml::Error> for BlockJobError {
    fn from(e: quick_xml::Error) -> Self {
        BlockJobError::Xml(e.to_string())
    }
}

/// Result type alias for block job operations.
pub type Result<T> = std::result::Result<T, BlockJobError>;
