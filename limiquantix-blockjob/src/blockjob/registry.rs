//! Per-domain store of block jobs keyed by job name.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{BlockJobError, Result};

use super::BlockJob;

/// Caller's handle on a registered job.
///
/// Handles are counted by the registry; each one must be given back with
/// [`BlockJobRegistry::release`] or consumed by
/// [`super::startup_finalize`]. A handle does not keep the job alive: the
/// registry owns the job and removing it invalidates outstanding handles.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "job handles must be released"]
pub struct JobRef {
    name: String,
}

impl JobRef {
    pub fn name(&self) -> &str {
        &self.name
    }
}

struct Entry {
    job: BlockJob,
    handles: usize,
}

/// Block jobs of one domain.
///
/// Created with the domain object and cleared when it goes away; never
/// shared between domains.
#[derive(Default)]
pub struct BlockJobRegistry {
    jobs: HashMap<String, Entry>,
}

impl BlockJobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a job and hand out the first handle to it.
    pub fn insert(&mut self, job: BlockJob) -> Result<JobRef> {
        if self.jobs.contains_key(&job.name) {
            return Err(BlockJobError::OperationInvalid(format!(
                "block job '{}' already exists",
                job.name
            )));
        }

        let name = job.name.clone();
        debug!(job = %name, job_type = %job.job_type.as_str(), "Registering block job");
        self.jobs.insert(name.clone(), Entry { job, handles: 1 });
        Ok(JobRef { name })
    }

    /// Store a job reconstructed from persisted state, without handles.
    pub(crate) fn restore(&mut self, job: BlockJob) {
        let name = job.name.clone();
        self.jobs.insert(name, Entry { job, handles: 0 });
    }

    /// Hand out another handle to a job.
    pub fn acquire(&mut self, name: &str) -> Option<JobRef> {
        let entry = self.jobs.get_mut(name)?;
        entry.handles += 1;
        Some(JobRef {
            name: name.to_string(),
        })
    }

    /// Give a handle back.
    pub fn release(&mut self, job: JobRef) {
        if let Some(entry) = self.jobs.get_mut(&job.name) {
            entry.handles = entry.handles.saturating_sub(1);
        }
    }

    /// Number of outstanding handles on a job.
    pub fn handle_count(&self, name: &str) -> usize {
        self.jobs.get(name).map(|e| e.handles).unwrap_or(0)
    }

    pub fn get(&self, name: &str) -> Option<&BlockJob> {
        self.jobs.get(name).map(|e| &e.job)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut BlockJob> {
        self.jobs.get_mut(name).map(|e| &mut e.job)
    }

    /// Remove a job regardless of outstanding handles.
    pub fn remove(&mut self, name: &str) -> Option<BlockJob> {
        self.jobs.remove(name).map(|e| e.job)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockJob> {
        self.jobs.values().map(|e| &e.job)
    }

    /// Job names in stable (sorted) order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop finished jobs nobody holds a handle to.
    ///
    /// Returns the names of the reaped jobs.
    pub fn reap_concluded(&mut self) -> Vec<String> {
        let mut reaped: Vec<String> = self
            .jobs
            .iter()
            .filter(|(_, e)| e.handles == 0 && e.job.state.is_terminal() && !e.job.invalid_data)
            .map(|(name, _)| name.clone())
            .collect();
        reaped.sort();

        for name in &reaped {
            debug!(job = %name, "Reaping concluded block job");
            self.jobs.remove(name);
        }
        reaped
    }

    /// Forget all jobs (domain teardown).
    pub fn clear(&mut self) {
        self.jobs.clear();
    }
}

impl std::fmt::Debug for BlockJobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockJobRegistry")
            .field("jobs", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockjob::BlockJobState;
    use crate::types::BlockJobType;

    #[test]
    fn test_handles_are_counted() {
        let mut reg = BlockJobRegistry::new();
        let first = reg.insert(BlockJob::new("job1", BlockJobType::Pull)).unwrap();
        let second = reg.acquire("job1").unwrap();
        assert_eq!(reg.handle_count("job1"), 2);

        reg.release(first);
        reg.release(second);
        assert_eq!(reg.handle_count("job1"), 0);
        assert!(reg.contains("job1"));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut reg = BlockJobRegistry::new();
        let h = reg.insert(BlockJob::new("job1", BlockJobType::Pull)).unwrap();
        assert!(reg.insert(BlockJob::new("job1", BlockJobType::Copy)).is_err());
        assert_eq!(reg.get("job1").unwrap().job_type, BlockJobType::Pull);
        reg.release(h);
    }

    #[test]
    fn test_reap_only_unreferenced_terminal_jobs() {
        let mut reg = BlockJobRegistry::new();
        let done = reg.insert(BlockJob::new("done", BlockJobType::Pull)).unwrap();
        let held = reg.insert(BlockJob::new("held", BlockJobType::Pull)).unwrap();
        let running = reg.insert(BlockJob::new("running", BlockJobType::Pull)).unwrap();

        reg.get_mut("done").unwrap().state = BlockJobState::Completed;
        reg.get_mut("held").unwrap().state = BlockJobState::Failed;
        reg.get_mut("running").unwrap().state = BlockJobState::Running;
        reg.release(done);
        reg.release(running);

        assert_eq!(reg.reap_concluded(), vec!["done".to_string()]);
        assert!(reg.contains("held"));
        assert!(reg.contains("running"));
        reg.release(held);
    }
}
