//! Subcommand implementations over a [`StatusStore`].

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use limiquantix_blockjob::blockjob::{BlockJob, JobBinding, JobPayload};
use limiquantix_blockjob::StatusStore;

/// One line of `list` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub domain: String,
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub state: String,
    pub disk: Option<String>,
    pub invalid: bool,
}

impl JobSummary {
    fn new(domain: &str, job: &BlockJob) -> Self {
        let job_type = match &job.broken_type {
            Some(orig) => format!("broken({})", orig),
            None => job.job_type.as_str().to_string(),
        };
        Self {
            domain: domain.to_string(),
            name: job.name.clone(),
            job_type,
            state: job.state.as_str().to_string(),
            disk: job.disk().map(str::to_string),
            invalid: job.invalid_data,
        }
    }
}

/// Everything known about one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub summary: JobSummary,
    pub newstate: Option<String>,
    pub errmsg: Option<String>,
    pub jobflags: Option<String>,
    pub mirror: bool,
    pub chain: Vec<String>,
    pub nodes: Vec<(String, String)>,
}

/// Result of `check` for one status file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub domain: String,
    pub error: Option<String>,
    pub invalid_jobs: Vec<String>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.error.is_none() && self.invalid_jobs.is_empty()
    }
}

/// Domain names end up in file paths under the state directory.
fn check_domain_name(domain: &str) -> Result<()> {
    if domain.is_empty() || domain.contains('/') || domain.contains("..") {
        bail!("invalid domain name '{}'", domain);
    }
    Ok(())
}

pub fn list(store: &StatusStore, domain: Option<&str>) -> Result<Vec<JobSummary>> {
    let domains = match domain {
        Some(d) => {
            check_domain_name(d)?;
            vec![d.to_string()]
        }
        None => store
            .list()
            .with_context(|| format!("Failed to read {}", store.state_dir().display()))?,
    };

    let mut out = Vec::new();
    for name in domains {
        let vm = match store.load_status(&name) {
            Ok(vm) => vm,
            Err(e) if domain.is_some() => {
                return Err(e).with_context(|| format!("Failed to load status of '{}'", name))
            }
            Err(e) => {
                warn!(domain = %name, error = %e, "Skipping unreadable status file");
                continue;
            }
        };

        for job_name in vm.private.blockjobs.names() {
            if let Some(job) = vm.private.blockjobs.get(&job_name) {
                out.push(JobSummary::new(&name, job));
            }
        }
    }
    Ok(out)
}

pub fn show(store: &StatusStore, domain: &str, job: &str) -> Result<JobDetail> {
    check_domain_name(domain)?;
    let vm = store
        .load_status(domain)
        .with_context(|| format!("Failed to load status of '{}'", domain))?;
    let job = vm
        .private
        .blockjobs
        .get(job)
        .ok_or_else(|| anyhow!("domain '{}' has no block job '{}'", domain, job))?;

    let (mirror, chain) = match &job.binding {
        JobBinding::Disk { dst, mirror } => {
            let chain = vm
                .def
                .disk(dst)
                .map(|d| d.src.chain().map(|l| l.describe()).collect())
                .unwrap_or_default();
            (*mirror, chain)
        }
        JobBinding::Chains { chain, .. } => (
            false,
            chain
                .iter()
                .flat_map(|c| c.chain().map(|l| l.describe()))
                .collect(),
        ),
        JobBinding::None => (false, Vec::new()),
    };

    let mut nodes = Vec::new();
    match &job.payload {
        JobPayload::Pull { base } => nodes.extend(base.iter().map(|n| ("base".to_string(), n.clone()))),
        JobPayload::Commit { top_parent, top, base, .. } => {
            for (role, node) in [("topparent", top_parent), ("top", top), ("base", base)] {
                if let Some(node) = node {
                    nodes.push((role.to_string(), node.clone()));
                }
            }
        }
        JobPayload::Backup { bitmap, store } => {
            if let Some(bitmap) = bitmap {
                nodes.push(("bitmap".to_string(), bitmap.clone()));
            }
            if let Some(node) = &store.node_format {
                nodes.push(("store".to_string(), node.clone()));
            }
        }
        JobPayload::Create { src, .. } => nodes.push(("create".to_string(), src.describe())),
        JobPayload::Copy { .. } | JobPayload::None => {}
    }

    Ok(JobDetail {
        summary: JobSummary::new(domain, job),
        newstate: job.newstate.map(|s| s.as_str().to_string()),
        errmsg: job.errmsg.clone(),
        jobflags: (!job.jobflags_missing).then(|| format!("0x{:x}", job.jobflags)),
        mirror,
        chain,
        nodes,
    })
}

/// Drop `job` from the status file of `domain`.
pub fn remove(store: &StatusStore, domain: &str, job: &str) -> Result<JobSummary> {
    check_domain_name(domain)?;
    let mut vm = store
        .load_status(domain)
        .with_context(|| format!("Failed to load status of '{}'", domain))?;

    let removed = vm
        .private
        .blockjobs
        .remove(job)
        .ok_or_else(|| anyhow!("domain '{}' has no block job '{}'", domain, job))?;

    for disk in vm.def.disks.iter_mut() {
        if disk.private.blockjob.as_deref() == Some(job) {
            disk.private.blockjob = None;
        }
    }

    store
        .save_status(&vm)
        .with_context(|| format!("Failed to save status of '{}'", domain))?;
    info!(domain = %domain, job = %job, "Block job removed");
    Ok(JobSummary::new(domain, &removed))
}

pub fn check(store: &StatusStore) -> Result<Vec<CheckReport>> {
    let domains = store
        .list()
        .with_context(|| format!("Failed to read {}", store.state_dir().display()))?;

    Ok(domains
        .into_iter()
        .map(|domain| match store.load_status(&domain) {
            Ok(vm) => {
                let mut invalid_jobs: Vec<String> = vm
                    .private
                    .blockjobs
                    .iter()
                    .filter(|j| j.invalid_data)
                    .map(|j| j.name.clone())
                    .collect();
                invalid_jobs.sort();
                CheckReport {
                    domain,
                    error: None,
                    invalid_jobs,
                }
            }
            Err(e) => CheckReport {
                domain,
                error: Some(e.to_string()),
                invalid_jobs: Vec::new(),
            },
        })
        .collect())
}
