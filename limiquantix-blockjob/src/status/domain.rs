//! `<domain>` element: the part of the definition kept in status and
//! config files.

use uuid::Uuid;

use crate::error::{BlockJobError, Result};
use crate::types::{
    BlockJobType, DiskDef, DiskMirrorState, DomainDef, LeaseDef, LockFailureAction, MemoryDef,
    MemoryModel, OsDef, StorageType,
};

use super::source::{parse_source_as, write_source_body};
use super::xml::{Element, XmlWriter};

/// Write `def` as a `<domain>` element.
pub fn write_domain(w: &mut XmlWriter, def: &DomainDef) {
    let attrs = if def.id >= 0 {
        vec![("id", def.id.to_string())]
    } else {
        Vec::new()
    };
    w.open("domain", &attrs);
    w.text("name", &def.name);
    w.text("uuid", &def.uuid.to_string());

    if def.on_lock_failure != LockFailureAction::Default {
        w.text("on_lockfailure", def.on_lock_failure.as_str());
    }

    write_os(w, &def.os);

    w.open("devices", &[]);
    for disk in &def.disks {
        write_disk(w, disk);
    }
    for lease in &def.leases {
        write_lease(w, lease);
    }
    for mem in &def.mems {
        write_memory(w, mem);
    }
    w.close("devices");

    w.close("domain");
}

fn write_os(w: &mut XmlWriter, os: &OsDef) {
    if *os == OsDef::default() {
        return;
    }

    w.open("os", &[]);
    for (name, value) in [
        ("kernel", &os.kernel),
        ("initrd", &os.initrd),
        ("dtb", &os.dtb),
        ("nvram", &os.nvram),
    ] {
        if let Some(value) = value {
            w.text(name, value);
        }
    }
    if let Some(slic) = &os.slic_table {
        w.open("acpi", &[]);
        w.text_with_attrs("table", &[("type", "slic".to_string())], slic);
        w.close("acpi");
    }
    w.close("os");
}

fn write_disk(w: &mut XmlWriter, disk: &DiskDef) {
    w.open(
        "disk",
        &[
            ("type", disk.src.storage_type.as_str().to_string()),
            ("device", "disk".to_string()),
        ],
    );
    write_source_body(w, &disk.src, true);

    if let Some(mirror) = &disk.mirror {
        let mut attrs = vec![("type", mirror.storage_type.as_str().to_string())];
        if disk.mirror_job != BlockJobType::Unknown {
            attrs.push(("job", disk.mirror_job.as_str().to_string()));
        }
        if disk.mirror_state != DiskMirrorState::None {
            attrs.push(("ready", disk.mirror_state.as_str().to_string()));
        }
        w.open("mirror", &attrs);
        write_source_body(w, mirror, true);
        w.close("mirror");
    }

    w.empty("target", &[("dev", disk.dst.clone())]);
    w.close("disk");
}

fn write_lease(w: &mut XmlWriter, lease: &LeaseDef) {
    w.open("lease", &[]);
    if let Some(lockspace) = &lease.lockspace {
        w.text("lockspace", lockspace);
    }
    w.text("key", &lease.key);
    w.empty(
        "target",
        &[("path", lease.path.clone()), ("offset", lease.offset.to_string())],
    );
    w.close("lease");
}

fn write_memory(w: &mut XmlWriter, mem: &MemoryDef) {
    let model = match mem.model {
        MemoryModel::Dimm => "dimm",
        MemoryModel::Nvdimm => "nvdimm",
    };
    match &mem.nvdimm_path {
        None => w.empty("memory", &[("model", model.to_string())]),
        Some(path) => {
            w.open("memory", &[("model", model.to_string())]);
            w.open("source", &[]);
            w.text("path", path);
            w.close("source");
            w.close("memory");
        }
    }
}

/// Parse a `<domain>` element.
pub fn parse_domain(el: &Element) -> Result<DomainDef> {
    let name = el
        .child_text("name")
        .filter(|n| !n.is_empty())
        .ok_or_else(|| BlockJobError::Xml("domain without a name".to_string()))?;

    let mut def = DomainDef::new(name);
    if let Some(uuid) = el.child_text("uuid") {
        def.uuid = Uuid::parse_str(uuid)
            .map_err(|e| BlockJobError::Xml(format!("invalid domain uuid '{}': {}", uuid, e)))?;
    }
    if let Some(id) = el.attr("id") {
        def.id = id
            .parse()
            .map_err(|_| BlockJobError::Xml(format!("invalid domain id '{}'", id)))?;
    }
    if let Some(action) = el.child_text("on_lockfailure") {
        def.on_lock_failure = LockFailureAction::parse(action)
            .ok_or_else(|| BlockJobError::Xml(format!("unknown lock failure action '{}'", action)))?;
    }

    if let Some(os) = el.child("os") {
        def.os = parse_os(os);
    }

    if let Some(devices) = el.child("devices") {
        for disk in devices.children_named("disk") {
            def.disks.push(parse_disk(disk)?);
        }
        for lease in devices.children_named("lease") {
            def.leases.push(parse_lease(lease)?);
        }
        for mem in devices.children_named("memory") {
            def.mems.push(MemoryDef {
                model: match mem.attr("model") {
                    Some("nvdimm") => MemoryModel::Nvdimm,
                    _ => MemoryModel::Dimm,
                },
                nvdimm_path: mem
                    .child("source")
                    .and_then(|s| s.child_text("path"))
                    .map(str::to_string),
            });
        }
    }

    Ok(def)
}

fn parse_os(el: &Element) -> OsDef {
    let text = |name: &str| el.child_text(name).map(str::to_string);
    OsDef {
        kernel: text("kernel"),
        initrd: text("initrd"),
        dtb: text("dtb"),
        nvram: text("nvram"),
        slic_table: el
            .child("acpi")
            .and_then(|a| a.children_named("table").find(|t| t.attr("type") == Some("slic")))
            .map(|t| t.text.clone()),
    }
}

fn parse_storage_type(el: &Element) -> Result<StorageType> {
    let t = el.attr("type").unwrap_or("none");
    StorageType::parse(t).ok_or_else(|| BlockJobError::Xml(format!("unknown storage type '{}'", t)))
}

fn parse_disk(el: &Element) -> Result<DiskDef> {
    let dst = el
        .child("target")
        .and_then(|t| t.attr("dev"))
        .ok_or_else(|| BlockJobError::Xml("disk without target".to_string()))?;

    let src = parse_source_as(el, parse_storage_type(el)?, dst)?;
    let mut disk = DiskDef::new(dst, src);

    if let Some(mirror) = el.child("mirror") {
        disk.mirror = Some(parse_source_as(mirror, parse_storage_type(mirror)?, dst)?);
        disk.mirror_job = mirror
            .attr("job")
            .and_then(BlockJobType::parse)
            .unwrap_or(BlockJobType::Copy);
        disk.mirror_state = mirror
            .attr("ready")
            .and_then(DiskMirrorState::parse)
            .unwrap_or_default();
    }

    Ok(disk)
}

fn parse_lease(el: &Element) -> Result<LeaseDef> {
    let target = el
        .child("target")
        .ok_or_else(|| BlockJobError::Xml("lease without target".to_string()))?;

    Ok(LeaseDef {
        lockspace: el.child_text("lockspace").map(str::to_string),
        key: el
            .child_text("key")
            .ok_or_else(|| BlockJobError::Xml("lease without key".to_string()))?
            .to_string(),
        path: target
            .attr("path")
            .ok_or_else(|| BlockJobError::Xml("lease target without path".to_string()))?
            .to_string(),
        offset: target
            .attr("offset")
            .map(|o| {
                o.parse()
                    .map_err(|_| BlockJobError::Xml(format!("invalid lease offset '{}'", o)))
            })
            .transpose()?
            .unwrap_or(0),
    })
}
