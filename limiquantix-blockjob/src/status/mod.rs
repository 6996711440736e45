//! Domain status persistence.
//!
//! The status file lets the driver reconnect to running domains after a
//! restart. Layout:
//!
//! ```text
//! <domstatus state='running' pid='4242'>
//!   <job type='none' async='migration out' phase='perform3'>   (only while active)
//!     <disk dev='vda' migrating='yes'>
//!       <migrationSource type='file' format='qcow2'>
//!         <source file='/img/vda.qcow2'/>
//!       </migrationSource>
//!     </disk>
//!     <migParams>
//!       <param name='compress-level' value='1'/>
//!     </migParams>
//!   </job>
//!   <blockjobs active='yes'>
//!     <blockjob name='copy-vda' type='copy' state='ready' jobflags='0x0'>
//!       <disk dst='vda' mirror='yes'/>
//!     </blockjob>
//!   </blockjobs>
//!   <domain>...</domain>
//! </domstatus>
//! ```

pub mod domain;
pub mod job;
pub mod source;
pub mod store;
pub mod xml;

pub use store::StatusStore;

use tracing::warn;

use crate::domain::{DomainObj, DomainPrivate, DomainState};
use crate::error::{BlockJobError, Result};
use crate::types::DomainDef;

use self::xml::{Element, XmlWriter};

/// Serialize the runtime state of `vm`.
pub fn format_status(vm: &DomainObj) -> String {
    let mut w = XmlWriter::new();
    w.open(
        "domstatus",
        &[
            ("state", vm.state.as_str().to_string()),
            ("pid", vm.pid.to_string()),
        ],
    );

    job::write_async_job(&mut w, &vm.private.job, &vm.def);
    job::write_blockjobs(&mut w, &vm.private.blockjobs);
    domain::write_domain(&mut w, &vm.def);

    w.close("domstatus");
    w.finish()
}

/// Rebuild a domain object from its status file contents.
pub fn parse_status(xml: &str) -> Result<DomainObj> {
    let root = Element::parse(xml)?;
    if root.name != "domstatus" {
        return Err(BlockJobError::Xml(format!(
            "unexpected root element '{}' in status file",
            root.name
        )));
    }

    let domain_el = root
        .child("domain")
        .ok_or_else(|| BlockJobError::Xml("status file without domain".to_string()))?;
    let mut def = domain::parse_domain(domain_el)?;

    let state = match root.attr("state") {
        Some(s) => DomainState::parse(s).unwrap_or_else(|| {
            warn!(state = %s, "Unknown domain state in status file");
            DomainState::Running
        }),
        None => DomainState::Running,
    };
    let pid = root
        .attr("pid")
        .map(|p| {
            p.parse()
                .map_err(|_| BlockJobError::Xml(format!("invalid pid '{}'", p)))
        })
        .transpose()?
        .unwrap_or(0);

    let job = job::parse_async_job(root.child("job"), &mut def)?;
    let blockjobs = job::parse_blockjobs(root.child("blockjobs"), &mut def);

    Ok(DomainObj {
        def,
        new_def: None,
        pid,
        state,
        private: DomainPrivate { blockjobs, job },
    })
}

/// Serialize a persistent definition.
pub fn format_config(def: &DomainDef) -> String {
    let mut w = XmlWriter::new();
    domain::write_domain(&mut w, def);
    w.finish()
}

/// Parse a persistent definition.
pub fn parse_config(xml: &str) -> Result<DomainDef> {
    let root = Element::parse(xml)?;
    if root.name != "domain" {
        return Err(BlockJobError::Xml(format!(
            "unexpected root element '{}' in domain config",
            root.name
        )));
    }
    domain::parse_domain(&root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockjob::{BlockJob, BlockJobState, JobBinding, JobPayload};
    use crate::domain::{AsyncJob, MigrationParam};
    use crate::types::{
        BlockJobType, DiskDef, DiskMirrorState, LeaseDef, MemoryDef, MemoryModel, StorageFormat,
        StorageSource,
    };

    fn chain(prefix: &str) -> StorageSource {
        StorageSource::file(format!("/img/{}-top.qcow2", prefix))
            .with_format(StorageFormat::Qcow2)
            .with_node_names(format!("{}-top-storage", prefix), format!("{}-top-format", prefix))
            .with_backing(
                StorageSource::file(format!("/img/{}-base.qcow2", prefix))
                    .with_format(StorageFormat::Qcow2)
                    .with_node_names(format!("{}-base-storage", prefix), format!("{}-base-format", prefix))
                    .with_readonly(true)
                    .with_backing(StorageSource::empty()),
            )
    }

    fn sample() -> DomainObj {
        let mut vda = DiskDef::new("vda", chain("vda"));
        vda.mirror = Some(
            StorageSource::file("/img/vda-copy.qcow2")
                .with_format(StorageFormat::Qcow2)
                .with_node_names("copy-storage", "copy-format"),
        );
        vda.mirror_job = BlockJobType::Copy;
        vda.mirror_state = DiskMirrorState::Ready;
        vda.private.migrating = true;
        vda.private.migr_source = Some(StorageSource::file("/img/vda-nbd.qcow2").with_format(StorageFormat::Qcow2));

        let def = DomainDef::new("vm1")
            .with_disk(vda)
            .with_disk(DiskDef::new("vdb", chain("vdb")))
            .with_lease(LeaseDef {
                lockspace: None,
                key: "lease1".to_string(),
                path: "/leases/l1".to_string(),
                offset: 0,
            });

        let mut vm = DomainObj::new(def);
        vm.state = DomainState::Running;
        vm.pid = 4242;
        vm.def.id = 7;
        vm.def.mems.push(MemoryDef {
            model: MemoryModel::Nvdimm,
            nvdimm_path: Some("/dev/pmem0".to_string()),
        });
        vm.def.os.slic_table = Some("/etc/slic.bin".to_string());
        vm.private.job = crate::domain::DomainJobState {
            async_job: AsyncJob::MigrationOut,
            phase: Some("perform3".to_string()),
            mig_params: vec![MigrationParam {
                name: "compress-level".to_string(),
                value: "1".to_string(),
            }],
        };

        let mut copy = BlockJob::new("copy-vda", BlockJobType::Copy).with_binding(JobBinding::Disk {
            dst: "vda".to_string(),
            mirror: true,
        });
        copy.state = BlockJobState::Ready;
        copy.payload = JobPayload::Copy { shallow_new: true };
        copy.jobflags = 0x12;

        let mut commit = BlockJob::new("commit-vdb", BlockJobType::Commit)
            .with_binding(JobBinding::Disk {
                dst: "vdb".to_string(),
                mirror: false,
            })
            .with_payload(JobPayload::Commit {
                top_parent: None,
                top: Some("vdb-top-format".to_string()),
                base: Some("vdb-base-format".to_string()),
                delete_committed_images: true,
            });
        commit.state = BlockJobState::Running;
        commit.newstate = Some(BlockJobState::Failed);
        commit.errmsg = Some("No space left on device".to_string());

        let mut backup = BlockJob::new_backup(
            "backup1",
            StorageSource::file("/backup/vm1.qcow2")
                .with_format(StorageFormat::Qcow2)
                .with_node_names("backup-storage", "backup-format"),
            Some("cpt1".to_string()),
        )
        .with_binding(JobBinding::Chains {
            chain: Some(chain("snap")),
            mirror_chain: None,
        });
        backup.state = BlockJobState::Running;

        let create = BlockJob::new_create("create1", StorageSource::file("/img/new.qcow2"), true);

        for job in [copy, commit, backup, create] {
            let dst = job.disk().map(str::to_string);
            let handle = crate::blockjob::register_for_disk(&mut vm, job, dst.as_deref(), None).unwrap();
            vm.private.blockjobs.release(handle);
        }
        vm
    }

    #[test]
    fn test_status_round_trip() {
        let vm = sample();
        let xml = format_status(&vm);
        let parsed = parse_status(&xml).unwrap();

        assert_eq!(parsed.def, vm.def);
        assert_eq!(parsed.state, vm.state);
        assert_eq!(parsed.pid, vm.pid);
        assert_eq!(parsed.private.job, vm.private.job);
        assert_eq!(parsed.private.blockjobs.names(), vm.private.blockjobs.names());
        for name in vm.private.blockjobs.names() {
            assert_eq!(parsed.private.blockjobs.get(&name), vm.private.blockjobs.get(&name));
        }
    }

    #[test]
    fn test_errmsg_whitespace_round_trip() {
        let mut vm = sample();
        vm.private.blockjobs.get_mut("commit-vdb").unwrap().errmsg =
            Some("  error:\n  No space left on device ".to_string());

        let parsed = parse_status(&format_status(&vm)).unwrap();
        assert_eq!(
            parsed.private.blockjobs.get("commit-vdb"),
            vm.private.blockjobs.get("commit-vdb")
        );
    }

    #[test]
    fn test_concluded_job_does_not_hold_disk_after_restart() {
        let mut vm = sample();

        // commit-vdb fails and gets unbound, as event processing does
        vm.private.blockjobs.get_mut("commit-vdb").unwrap().state = BlockJobState::Failed;
        vm.def.disk_mut("vdb").unwrap().private.blockjob = None;

        let mut restored = parse_status(&format_status(&vm)).unwrap();
        assert_eq!(restored.def, vm.def);
        assert!(restored.def.disk("vdb").unwrap().private.blockjob.is_none());

        let handle = crate::blockjob::register_for_disk(
            &mut restored,
            BlockJob::new("commit2-vdb", BlockJobType::Commit),
            Some("vdb"),
            None,
        )
        .unwrap();
        restored.private.blockjobs.release(handle);
    }

    #[test]
    fn test_inactive_async_job_not_written() {
        let mut vm = sample();
        vm.private.job.reset();
        let xml = format_status(&vm);
        assert!(!xml.contains("<job "));
        assert!(!xml.contains("migrationSource"));
    }

    #[test]
    fn test_missing_blockjobs_is_empty_registry() {
        let xml = "<domstatus state='running' pid='1'>\n  <domain>\n    <name>vm1</name>\n  </domain>\n</domstatus>\n";
        let vm = parse_status(xml).unwrap();
        assert!(vm.private.blockjobs.is_empty());
        assert_eq!(vm.def.name, "vm1");
    }

    #[test]
    fn test_unknown_job_type_kept_as_broken() {
        let xml = r#"<domstatus state='running' pid='1'>
  <blockjobs active='yes'>
    <blockjob name='weird' type='teleport' state='running'>
      <disk dst='vda'/>
    </blockjob>
    <blockjob type='pull' state='running'/>
  </blockjobs>
  <domain>
    <name>vm1</name>
    <devices>
      <disk type='file' device='disk'>
        <source file='/img/vda.qcow2'/>
        <target dev='vda'/>
      </disk>
    </devices>
  </domain>
</domstatus>
"#;
        let vm = parse_status(xml).unwrap();
        assert_eq!(vm.private.blockjobs.len(), 1);

        let job = vm.private.blockjobs.get("weird").unwrap();
        assert_eq!(job.job_type, BlockJobType::Broken);
        assert_eq!(job.broken_type.as_deref(), Some("teleport"));
        assert!(job.invalid_data);
        assert!(job.jobflags_missing);
        assert!(!crate::blockjob::has_active_job(&vm, false));

        // broken jobs survive another save/load cycle
        let again = parse_status(&format_status(&vm)).unwrap();
        assert_eq!(again.private.blockjobs.get("weird"), Some(job));
    }

    #[test]
    fn test_config_round_trip() {
        let vm = sample();
        let mut def = vm.def.clone();
        for disk in def.disks.iter_mut() {
            disk.private = Default::default();
        }
        let parsed = parse_config(&format_config(&def)).unwrap();
        assert_eq!(parsed, def);
    }
}
