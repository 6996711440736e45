//! `<blockjobs>` and `<job>` elements of the status file.

use tracing::{debug, warn};

use crate::blockjob::{BlockJob, BlockJobRegistry, BlockJobState, JobBinding, JobPayload};
use crate::chain::find_by_node_name;
use crate::domain::{AsyncJob, DomainJobState, MigrationParam};
use crate::error::{BlockJobError, Result};
use crate::types::{BlockJobType, DomainDef, StorageSource};

use super::source::{parse_source, write_source};
use super::xml::{parse_uint, yes_no, Element, XmlWriter};

// =============================================================================
// BLOCK JOBS
// =============================================================================

/// Write the whole registry. Jobs are written in name order.
pub fn write_blockjobs(w: &mut XmlWriter, jobs: &BlockJobRegistry) {
    let active = jobs.iter().any(|j| j.is_active());
    w.open("blockjobs", &[("active", yes_no(active))]);

    for name in jobs.names() {
        if let Some(job) = jobs.get(&name) {
            write_blockjob(w, job);
        }
    }

    w.close("blockjobs");
}

fn write_blockjob(w: &mut XmlWriter, job: &BlockJob) {
    let mut attrs = vec![
        ("name", job.name.clone()),
        ("type", job.job_type.as_str().to_string()),
        ("state", job.state.as_str().to_string()),
    ];
    if let Some(newstate) = job.newstate {
        attrs.push(("newstate", newstate.as_str().to_string()));
    }
    if let Some(broken) = &job.broken_type {
        attrs.push(("brokentype", broken.clone()));
    }
    if !job.jobflags_missing {
        attrs.push(("jobflags", format!("0x{:x}", job.jobflags)));
    }
    w.open("blockjob", &attrs);

    if let Some(errmsg) = &job.errmsg {
        w.text("errmsg", errmsg);
    }

    match &job.binding {
        JobBinding::None => {}
        JobBinding::Disk { dst, mirror } => {
            let mut attrs = vec![("dst", dst.clone())];
            if *mirror {
                attrs.push(("mirror", "yes".to_string()));
            }
            w.empty("disk", &attrs);
        }
        JobBinding::Chains { chain, mirror_chain } => {
            w.open("chains", &[]);
            if let Some(chain) = chain {
                write_source(w, "disk", chain, &[]);
            }
            if let Some(mirror) = mirror_chain {
                write_source(w, "mirror", mirror, &[]);
            }
            w.close("chains");
        }
    }

    write_payload(w, &job.payload);
    w.close("blockjob");
}

fn write_node(w: &mut XmlWriter, name: &str, node: &Option<String>) {
    if let Some(node) = node {
        w.empty(name, &[("node", node.clone())]);
    }
}

fn write_payload(w: &mut XmlWriter, payload: &JobPayload) {
    match payload {
        JobPayload::None => {}
        JobPayload::Pull { base } => write_node(w, "base", base),
        JobPayload::Commit {
            top_parent,
            top,
            base,
            delete_committed_images,
        } => {
            write_node(w, "topparent", top_parent);
            write_node(w, "top", top);
            write_node(w, "base", base);
            if *delete_committed_images {
                w.empty("deleteCommittedImages", &[]);
            }
        }
        JobPayload::Copy { shallow_new } => {
            if *shallow_new {
                w.empty("copy", &[("shallownew", "yes".to_string())]);
            }
        }
        JobPayload::Create { storage, src } => {
            if *storage {
                w.empty("create", &[("mode", "storage".to_string())]);
            }
            write_source(w, "src", src, &[]);
        }
        JobPayload::Backup { bitmap, store } => {
            if let Some(bitmap) = bitmap {
                w.empty("bitmap", &[("name", bitmap.clone())]);
            }
            write_source(w, "store", store, &[]);
        }
    }
}

/// Restore the registry from `<blockjobs>`, binding jobs to the disks of
/// `def`.
///
/// Jobs that can't be understood are kept with `invalid_data` set. A
/// missing element yields an empty registry.
pub fn parse_blockjobs(el: Option<&Element>, def: &mut DomainDef) -> BlockJobRegistry {
    let mut jobs = BlockJobRegistry::new();
    let Some(el) = el else {
        return jobs;
    };

    for job_el in el.children_named("blockjob") {
        let Some(mut job) = parse_blockjob(job_el) else {
            continue;
        };
        if jobs.contains(&job.name) {
            warn!(job = %job.name, "Duplicate block job in status file, skipping");
            continue;
        }

        bind_restored(&mut job, def);
        jobs.restore(job);
    }

    jobs
}

fn parse_blockjob(el: &Element) -> Option<BlockJob> {
    let Some(name) = el.attr("name") else {
        warn!("Block job without a name in status file, skipping");
        return None;
    };

    let type_str = el.attr("type").unwrap_or_default();
    let (job_type, broken_type) = match BlockJobType::parse(type_str) {
        Some(BlockJobType::Broken) => (BlockJobType::Broken, el.attr("brokentype").map(str::to_string)),
        Some(t) => (t, None),
        None => {
            warn!(job = %name, job_type = %type_str, "Unknown block job type, keeping job as broken");
            (BlockJobType::Broken, Some(type_str.to_string()))
        }
    };

    let mut job = BlockJob::new(name, job_type);
    job.broken_type = broken_type;
    job.invalid_data = job_type == BlockJobType::Broken;

    match el.attr("state").map(|s| (s, BlockJobState::parse(s))) {
        Some((_, Some(state))) => job.state = state,
        Some((s, None)) => {
            warn!(job = %name, state = %s, "Unknown block job state");
            job.invalid_data = true;
        }
        None => job.invalid_data = true,
    }
    job.newstate = el.attr("newstate").and_then(BlockJobState::parse);

    match el.attr("jobflags").map(parse_uint) {
        Some(Some(flags)) => job.jobflags = flags as u32,
        Some(None) => job.invalid_data = true,
        None => job.jobflags_missing = true,
    }

    job.errmsg = el.child("errmsg").map(|e| e.text.clone());

    if let Some(disk) = el.child("disk") {
        match disk.attr("dst") {
            Some(dst) => {
                job.binding = JobBinding::Disk {
                    dst: dst.to_string(),
                    mirror: disk.attr_bool("mirror").unwrap_or(false),
                }
            }
            None => job.invalid_data = true,
        }
    } else if let Some(chains) = el.child("chains") {
        let chain = parse_optional_source(chains.child("disk"), &mut job);
        let mirror_chain = parse_optional_source(chains.child("mirror"), &mut job);
        job.binding = JobBinding::Chains { chain, mirror_chain };
    }

    job.payload = parse_payload(el, &mut job);
    Some(job)
}

fn parse_optional_source(el: Option<&Element>, job: &mut BlockJob) -> Option<StorageSource> {
    let el = el?;
    match parse_source(el, &job.name) {
        Ok(src) => Some(src),
        Err(e) => {
            warn!(job = %job.name, error = %e, "Unable to parse block job chain");
            job.invalid_data = true;
            None
        }
    }
}

fn node_attr(el: &Element, name: &str) -> Option<String> {
    el.child(name).and_then(|c| c.attr("node")).map(str::to_string)
}

fn parse_payload(el: &Element, job: &mut BlockJob) -> JobPayload {
    match job.job_type {
        BlockJobType::Pull => JobPayload::Pull {
            base: node_attr(el, "base"),
        },
        BlockJobType::Commit | BlockJobType::ActiveCommit => JobPayload::Commit {
            top_parent: node_attr(el, "topparent"),
            top: node_attr(el, "top"),
            base: node_attr(el, "base"),
            delete_committed_images: el.has_child("deleteCommittedImages"),
        },
        BlockJobType::Copy => JobPayload::Copy {
            shallow_new: el
                .child("copy")
                .and_then(|c| c.attr_bool("shallownew"))
                .unwrap_or(false),
        },
        BlockJobType::Create => {
            let storage = el.child("create").and_then(|c| c.attr("mode")) == Some("storage");
            let src = parse_required_source(el.child("src"), job);
            JobPayload::Create { storage, src }
        }
        BlockJobType::Backup => {
            let bitmap = el
                .child("bitmap")
                .and_then(|b| b.attr("name"))
                .map(str::to_string);
            let store = parse_required_source(el.child("store"), job);
            JobPayload::Backup { bitmap, store }
        }
        BlockJobType::Unknown | BlockJobType::Internal | BlockJobType::Broken => JobPayload::None,
    }
}

fn parse_required_source(el: Option<&Element>, job: &mut BlockJob) -> StorageSource {
    match parse_optional_source(el, job) {
        Some(src) => src,
        None => {
            job.invalid_data = true;
            StorageSource::empty()
        }
    }
}

/// Tie a restored job to its disk and check its node references.
fn bind_restored(job: &mut BlockJob, def: &mut DomainDef) {
    let binding = job.binding.clone();
    let chain: Option<StorageSource> = match &binding {
        JobBinding::Disk { dst, mirror } => match def.disk_mut(dst) {
            Some(disk) => {
                if *mirror && disk.mirror.is_none() {
                    warn!(job = %job.name, disk = %dst, "Block job refers to a missing mirror");
                    job.invalid_data = true;
                }
                if job.state.is_terminal() {
                    debug!(job = %job.name, disk = %dst, "Block job already concluded, disk left free");
                } else if disk.private.blockjob.is_some() {
                    warn!(job = %job.name, disk = %dst, "Disk already has a block job");
                    job.invalid_data = true;
                } else if !job.invalid_data {
                    disk.private.blockjob = Some(job.name.clone());
                }
                Some(disk.src.clone())
            }
            None => {
                warn!(job = %job.name, disk = %dst, "Block job refers to an unknown disk");
                job.invalid_data = true;
                None
            }
        },
        JobBinding::Chains { chain, .. } => chain.clone(),
        JobBinding::None => None,
    };

    let nodes: Vec<String> = match &job.payload {
        JobPayload::Pull { base } => [base].into_iter().flatten().cloned().collect(),
        JobPayload::Commit { top_parent, top, base, .. } => {
            [top_parent, top, base].into_iter().flatten().cloned().collect()
        }
        _ => Vec::new(),
    };

    let unresolved: Vec<String> = nodes
        .into_iter()
        .filter(|node| {
            !chain
                .as_ref()
                .is_some_and(|c| find_by_node_name(c, node).is_some())
        })
        .collect();

    if !unresolved.is_empty() {
        warn!(job = %job.name, nodes = ?unresolved, "Block job refers to unknown nodes");
        job.invalid_data = true;
        unbind(job, def);
    }
}

fn unbind(job: &BlockJob, def: &mut DomainDef) {
    if let Some(dst) = job.disk() {
        if let Some(disk) = def.disk_mut(dst) {
            if disk.private.blockjob.as_deref() == Some(job.name.as_str()) {
                disk.private.blockjob = None;
            }
        }
    }
}

// =============================================================================
// ASYNC JOB
// =============================================================================

/// Write the async job with its private data. Nothing is written while no
/// job is active.
pub fn write_async_job(w: &mut XmlWriter, job: &DomainJobState, def: &DomainDef) {
    if !job.is_active() {
        return;
    }

    let mut attrs = vec![
        ("type", "none".to_string()),
        ("async", job.async_job.as_str().to_string()),
    ];
    if let Some(phase) = &job.phase {
        attrs.push(("phase", phase.clone()));
    }
    w.open("job", &attrs);

    for disk in &def.disks {
        if !disk.private.migrating && disk.private.migr_source.is_none() {
            continue;
        }

        let attrs = [
            ("dev", disk.dst.clone()),
            ("migrating", yes_no(disk.private.migrating)),
        ];
        match &disk.private.migr_source {
            None => w.empty("disk", &attrs),
            Some(src) => {
                w.open("disk", &attrs);
                write_migration_source(w, src);
                w.close("disk");
            }
        }
    }

    if !job.mig_params.is_empty() {
        w.open("migParams", &[]);
        for param in &job.mig_params {
            w.empty(
                "param",
                &[("name", param.name.clone()), ("value", param.value.clone())],
            );
        }
        w.close("migParams");
    }

    w.close("job");
}

fn write_migration_source(w: &mut XmlWriter, src: &StorageSource) {
    let attrs = [
        ("type", src.storage_type.as_str().to_string()),
        ("format", src.format.as_str().to_string()),
    ];
    w.open("migrationSource", &attrs);
    super::source::write_source_body(w, src, false);
    w.close("migrationSource");
}

/// Restore the async job and the per-disk migration data.
pub fn parse_async_job(el: Option<&Element>, def: &mut DomainDef) -> Result<DomainJobState> {
    let Some(el) = el else {
        return Ok(DomainJobState::default());
    };

    let async_str = el.attr("async").unwrap_or("none");
    let async_job = AsyncJob::parse(async_str)
        .ok_or_else(|| BlockJobError::Xml(format!("unknown async job type '{}'", async_str)))?;

    for disk_el in el.children_named("disk") {
        let Some(dev) = disk_el.attr("dev") else {
            return Err(BlockJobError::Xml("missing 'dev' attribute in migration disk".to_string()));
        };
        let Some(disk) = def.disk_mut(dev) else {
            warn!(disk = %dev, "Migration data for unknown disk, ignoring");
            continue;
        };

        disk.private.migrating = disk_el.attr_bool("migrating").unwrap_or(false);
        if let Some(src_el) = disk_el.child("migrationSource") {
            disk.private.migr_source = Some(parse_source(src_el, dev)?);
        }
    }

    let mig_params = el
        .child("migParams")
        .map(|p| {
            p.children_named("param")
                .filter_map(|param| {
                    Some(MigrationParam {
                        name: param.attr("name")?.to_string(),
                        value: param.attr("value").unwrap_or_default().to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(DomainJobState {
        async_job,
        phase: el.attr("phase").map(str::to_string),
        mig_params,
    })
}
