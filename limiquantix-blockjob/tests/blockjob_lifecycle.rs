//! Integration tests for the block job lifecycle.
//!
//! These drive whole flows through the public API with the mock
//! collaborators: job admission, event processing, pivot, persistence and
//! storage access grants.

use std::sync::Arc;

use limiquantix_blockjob::blockjob::{self, BlockJob, BlockJobState, JobBinding, JobPayload};
use limiquantix_blockjob::mock::{
    AccessCall, MockMonitor, MonitorCall, RecordingAccess, RecordingLockDriver, StaticProber,
};
use limiquantix_blockjob::monitor::NamedBlockNode;
use limiquantix_blockjob::{
    BlockJobError, BlockJobEventProcessor, BlockJobStatus, BlockJobType, DiskDef, DiskMirrorState,
    Domain, DomainDef, DomainEvent, DomainObj, DomainState, DriverConfig, DriverContext, EventQueue,
    LockManagerPlugin, NvmeAddress, StatusStore, StorageFormat, StorageSource,
    StorageSourceAccessManager,
};

struct Harness {
    ctx: Arc<DriverContext>,
    processor: BlockJobEventProcessor,
    locks: Arc<RecordingLockDriver>,
    events: Arc<EventQueue>,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let locks = Arc::new(RecordingLockDriver::new());
    let events = Arc::new(EventQueue::new());
    let prober = StaticProber::new().with_chain(
        "/img/vda-copy.qcow2",
        StorageSource::file("/img/base.qcow2")
            .with_format(StorageFormat::Qcow2)
            .with_readonly(true)
            .with_backing(StorageSource::empty()),
    );

    let ctx = Arc::new(
        DriverContext::new(DriverConfig::default())
            .unwrap()
            .with_store(StatusStore::new(dir.path().join("run"), dir.path().join("etc")))
            .with_events(events.clone())
            .with_prober(Arc::new(prober))
            .with_lock_plugin(LockManagerPlugin::with_driver(locks.clone())),
    );

    Harness {
        processor: BlockJobEventProcessor::new(ctx.clone()),
        ctx,
        locks,
        events,
        _dir: dir,
    }
}

fn running_vm() -> DomainObj {
    let def = DomainDef::new("vm1")
        .with_disk(DiskDef::new(
            "vda",
            StorageSource::file("/img/vda.qcow2").with_format(StorageFormat::Qcow2),
        ))
        .with_disk(DiskDef::new(
            "vdb",
            StorageSource::file("/img/vdb.qcow2").with_format(StorageFormat::Qcow2),
        ));
    let mut vm = DomainObj::new(def);
    vm.state = DomainState::Running;
    vm.pid = 4242;
    vm
}

fn node(name: &str, file: &str, drv: &str) -> NamedBlockNode {
    NamedBlockNode {
        node_name: name.to_string(),
        file: file.to_string(),
        drv: drv.to_string(),
    }
}

/// Start a copy job on vda with its mirror granted and registered.
async fn start_copy(h: &Harness, domain: &Domain) {
    let access = StorageSourceAccessManager::new(h.ctx.clone());
    let mut vm = domain.lock().await;
    h.ctx.locks.process_start(h.ctx.uri(), &vm, false).unwrap();

    let mirror = StorageSource::file("/img/vda-copy.qcow2").with_format(StorageFormat::Qcow2);
    access.allow(&vm, &mirror, false, true, true).unwrap();

    let disk = vm.def.disk_mut("vda").unwrap();
    disk.mirror = Some(mirror);
    disk.mirror_job = BlockJobType::Copy;

    let job = BlockJob::new("copy-vda", BlockJobType::Copy).with_binding(JobBinding::Disk {
        dst: "vda".to_string(),
        mirror: true,
    });
    let handle = blockjob::register_for_disk(&mut vm, job, Some("vda"), Some(&h.ctx.store)).unwrap();
    blockjob::mark_started(&mut vm, &handle);
    assert!(blockjob::startup_finalize(&mut vm, handle).is_none());
}

#[tokio::test]
async fn test_copy_job_pivots_to_mirror() {
    let h = harness();
    let monitor = Arc::new(MockMonitor::new().with_nodes(vec![
        node("copy-format", "/img/vda-copy.qcow2", "qcow2"),
        node("copy-storage", "/img/vda-copy.qcow2", "file"),
        node("base-format", "/img/base.qcow2", "qcow2"),
    ]));
    let domain = Domain::new(running_vm(), monitor.clone());
    start_copy(&h, &domain).await;
    assert!(h.locks.held().contains("/img/vda-copy.qcow2"));

    domain
        .handle_block_job_event(&h.processor, "copy-vda", BlockJobState::Ready, None)
        .await
        .unwrap();
    assert_eq!(
        domain.lock().await.def.disk("vda").unwrap().mirror_state,
        DiskMirrorState::Ready
    );

    domain.pivot("vda").await.unwrap();
    assert_eq!(monitor.calls(), vec![MonitorCall::BlockJobComplete("copy-vda".to_string())]);

    domain
        .handle_block_job_event(&h.processor, "copy-vda", BlockJobState::Completed, None)
        .await
        .unwrap();

    let vm = domain.lock().await;
    let disk = vm.def.disk("vda").unwrap();
    assert_eq!(disk.src.path.as_deref(), Some("/img/vda-copy.qcow2"));
    assert_eq!(disk.src.node_format.as_deref(), Some("copy-format"));
    assert_eq!(disk.src.node_storage.as_deref(), Some("copy-storage"));
    let base = disk.src.backing_store.as_deref().unwrap();
    assert_eq!(base.path.as_deref(), Some("/img/base.qcow2"));
    assert_eq!(base.node_format.as_deref(), Some("base-format"));
    assert!(disk.mirror.is_none());
    assert!(disk.private.blockjob.is_none());

    assert!(!h.locks.held().contains("/img/vda.qcow2"));
    assert!(h.locks.held().contains("/img/vda-copy.qcow2"));
    assert!(!blockjob::has_active_job(&vm, false));

    let events = h.events.for_domain("vm1");
    assert!(events.contains(&DomainEvent::BlockJob2 {
        domain: "vm1".to_string(),
        disk: "vda".to_string(),
        job_type: BlockJobType::Copy,
        status: BlockJobStatus::Completed,
    }));

    let saved = h.ctx.store.load_status("vm1").unwrap();
    assert_eq!(
        saved.private.blockjobs.get("copy-vda").unwrap().state,
        BlockJobState::Completed
    );
    assert_eq!(
        saved.def.disk("vda").unwrap().src.path.as_deref(),
        Some("/img/vda-copy.qcow2")
    );
}

#[tokio::test]
async fn test_failed_pivot_request_reverts_state() {
    let h = harness();
    let monitor = Arc::new(MockMonitor::new());
    monitor.fail_on("block-job-complete");
    let domain = Domain::new(running_vm(), monitor.clone());
    start_copy(&h, &domain).await;

    domain
        .handle_block_job_event(&h.processor, "copy-vda", BlockJobState::Ready, None)
        .await
        .unwrap();

    let err = domain.pivot("vda").await.unwrap_err();
    assert!(matches!(err, BlockJobError::Monitor(_)));

    let vm = domain.lock().await;
    assert_eq!(vm.def.disk("vda").unwrap().mirror_state, DiskMirrorState::Ready);
    assert_eq!(
        vm.private.blockjobs.get("copy-vda").unwrap().state,
        BlockJobState::Ready
    );
}

#[tokio::test]
async fn test_abort_drops_mirror_on_cancel_event() {
    let h = harness();
    let monitor = Arc::new(MockMonitor::new());
    let domain = Domain::new(running_vm(), monitor.clone());
    start_copy(&h, &domain).await;

    domain.abort("vda", true).await.unwrap();
    assert_eq!(
        monitor.calls(),
        vec![MonitorCall::BlockJobCancel {
            job: "copy-vda".to_string(),
            force: true
        }]
    );
    {
        let vm = domain.lock().await;
        assert_eq!(vm.def.disk("vda").unwrap().mirror_state, DiskMirrorState::Abort);
        assert_eq!(
            vm.private.blockjobs.get("copy-vda").unwrap().state,
            BlockJobState::Aborting
        );
    }

    domain
        .handle_block_job_event(&h.processor, "copy-vda", BlockJobState::Cancelled, None)
        .await
        .unwrap();

    let vm = domain.lock().await;
    let disk = vm.def.disk("vda").unwrap();
    assert_eq!(disk.src.path.as_deref(), Some("/img/vda.qcow2"));
    assert!(disk.mirror.is_none());
    assert!(!h.locks.held().contains("/img/vda-copy.qcow2"));
    assert!(h.locks.held().contains("/img/vda.qcow2"));
}

#[tokio::test]
async fn test_second_job_on_busy_disk_rejected() {
    let h = harness();
    let domain = Domain::new(running_vm(), Arc::new(MockMonitor::new()));
    start_copy(&h, &domain).await;

    let mut vm = domain.lock().await;
    let commit = BlockJob::new("commit-vda", BlockJobType::Commit);
    let err = blockjob::register_for_disk(&mut vm, commit, Some("vda"), Some(&h.ctx.store)).unwrap_err();

    assert!(matches!(err, BlockJobError::OperationInvalid(_)));
    assert!(err.to_string().contains("already in active block job"));
    assert_eq!(vm.private.blockjobs.names(), vec!["copy-vda".to_string()]);

    // other disks are unaffected
    let pull = blockjob::register_for_disk(
        &mut vm,
        BlockJob::new("pull-vdb", BlockJobType::Pull),
        Some("vdb"),
        None,
    )
    .unwrap();
    vm.private.blockjobs.release(pull);
}

#[test]
fn test_backup_job_survives_restart() {
    let h = harness();
    let mut vm = running_vm();

    let store = StorageSource::file("/backup/vm1-vda.qcow2")
        .with_format(StorageFormat::Qcow2)
        .with_node_names("backup-storage", "backup-format");
    let job = BlockJob::new_backup("backup1", store, Some("cpt1".to_string())).with_binding(JobBinding::Chains {
        chain: Some(vm.def.disk("vda").unwrap().src.clone()),
        mirror_chain: None,
    });
    let handle = blockjob::register_for_disk(&mut vm, job, None, Some(&h.ctx.store)).unwrap();
    blockjob::mark_started(&mut vm, &handle);
    vm.private.blockjobs.release(handle);
    h.ctx.store.save_status(&vm).unwrap();

    let restored = h.ctx.store.load_status("vm1").unwrap();
    let job = restored.private.blockjobs.get("backup1").unwrap();
    assert_eq!(job.job_type, BlockJobType::Backup);
    assert_eq!(job.state, BlockJobState::Running);
    assert!(!job.invalid_data);
    match &job.payload {
        JobPayload::Backup { bitmap, store } => {
            assert_eq!(bitmap.as_deref(), Some("cpt1"));
            assert_eq!(store.node_storage.as_deref(), Some("backup-storage"));
            assert_eq!(store.node_format.as_deref(), Some("backup-format"));
        }
        other => panic!("unexpected payload {:?}", other),
    }
    assert_eq!(job, vm.private.blockjobs.get("backup1").unwrap());
}

#[test]
fn test_job_with_unknown_node_is_kept_but_inactive() {
    let h = harness();
    let chain = StorageSource::file("/img/vda.qcow2")
        .with_node_names("storage0", "format0")
        .with_backing(
            StorageSource::file("/img/vda-1.qcow2")
                .with_node_names("storage1", "format1")
                .with_backing(
                    StorageSource::file("/img/vda-2.qcow2")
                        .with_node_names("storage2", "format2")
                        .with_backing(StorageSource::empty()),
                ),
        );
    let mut vm = DomainObj::new(DomainDef::new("vm1").with_disk(DiskDef::new("vda", chain)));
    vm.state = DomainState::Running;

    let commit = BlockJob::new("commit-vda", BlockJobType::Commit).with_payload(JobPayload::Commit {
        top_parent: None,
        top: Some("format1".to_string()),
        base: Some("format3".to_string()),
        delete_committed_images: false,
    });
    let handle = blockjob::register_for_disk(&mut vm, commit, Some("vda"), None).unwrap();
    blockjob::mark_started(&mut vm, &handle);
    vm.private.blockjobs.release(handle);
    h.ctx.store.save_status(&vm).unwrap();

    let mut restored = h.ctx.store.load_status("vm1").unwrap();
    let job = restored.private.blockjobs.get("commit-vda").unwrap();
    assert!(job.invalid_data);
    assert!(!blockjob::has_active_job(&restored, false));
    assert!(restored.def.disk("vda").unwrap().private.blockjob.is_none());
    assert_eq!(restored.private.blockjobs.names(), vec!["commit-vda".to_string()]);

    // the disk accepts a new job
    let pull = blockjob::register_for_disk(
        &mut restored,
        BlockJob::new("pull-vda", BlockJobType::Pull),
        Some("vda"),
        None,
    )
    .unwrap();
    restored.private.blockjobs.release(pull);

    // operator cleanup
    assert!(restored.private.blockjobs.remove("commit-vda").is_some());
    h.ctx.store.save_status(&restored).unwrap();
    let again = h.ctx.store.load_status("vm1").unwrap();
    assert_eq!(again.private.blockjobs.names(), vec!["pull-vda".to_string()]);
}

#[test]
fn test_nvme_grant_failure_leaves_nothing_behind() {
    let h = harness();
    let access = Arc::new(RecordingAccess::new().with_memlock_limit(65536));
    access.fail_on("setup_cgroup");
    let mgr = StorageSourceAccessManager::new(h.ctx.clone())
        .with_security(access.clone())
        .with_cgroup(access.clone())
        .with_namespace(access.clone())
        .with_hostdev(access.clone())
        .with_memlock(access.clone());

    let vm = running_vm();
    let nvme = StorageSource::nvme(NvmeAddress {
        domain: 0,
        bus: 0x3b,
        slot: 0,
        function: 0,
        namespace: 1,
        managed: true,
    });

    let err = mgr.allow(&vm, &nvme, false, true, true).unwrap_err();
    assert!(matches!(err, BlockJobError::Cgroup(_)));

    let calls = access.calls();
    let undo: Vec<_> = calls
        .iter()
        .skip_while(|c| !matches!(c, AccessCall::SetupCgroup(_)))
        .skip(1)
        .cloned()
        .collect();
    assert!(matches!(undo[0], AccessCall::RestoreLabel { .. }));
    assert!(matches!(undo[1], AccessCall::TeardownNamespace(_)));
    assert_eq!(undo[2], AccessCall::SetMemlock(65536));
    assert_eq!(undo[3], AccessCall::ReleaseNvme(1));
    assert_eq!(undo.len(), 4);

    assert_eq!(access.memlock_limit(), 65536);
    assert!(h.locks.held().is_empty());
}

#[test]
fn test_events_coalesce_while_synchronous() {
    let h = harness();
    let mut vm = running_vm();
    let handle = blockjob::register_for_disk(
        &mut vm,
        BlockJob::new("pull-vdb", BlockJobType::Pull),
        Some("vdb"),
        None,
    )
    .unwrap();
    blockjob::mark_started(&mut vm, &handle);

    h.processor.sync_begin(&mut vm, &handle);
    h.processor.handle_event(&mut vm, "pull-vdb", BlockJobState::Completed, None);
    h.processor
        .handle_event(&mut vm, "pull-vdb", BlockJobState::Failed, Some("EIO".to_string()));
    let outcome = h.processor.sync_end(&mut vm, &handle).unwrap();

    assert_eq!(outcome.state, BlockJobState::Failed);
    let statuses: Vec<_> = h.events.get_all().iter().map(|e| e.status()).collect();
    assert!(statuses.iter().all(|s| *s == BlockJobStatus::Failed));
    assert!(!statuses.is_empty());
    vm.private.blockjobs.release(handle);
}
