//! Storage source (backing chain) elements.
//!
//! ```text
//! <backingStore type='file'>
//!   <format type='qcow2'/>
//!   <source file='/img/base.qcow2' index='2'>
//!     <privateData>
//!       <nodenames>
//!         <nodename type='storage' name='libvirt-2-storage'/>
//!         <nodename type='format' name='libvirt-2-format'/>
//!       </nodenames>
//!     </privateData>
//!   </source>
//!   <readonly/>
//!   <backingStore/>
//! </backingStore>
//! ```
//!
//! An empty `<backingStore/>` is the chain terminator; a missing one means
//! the chain below was never probed.

use crate::chain::MAX_CHAIN_DEPTH;
use crate::error::{BlockJobError, Result};
use crate::types::{NvmeAddress, SourcePrivate, StorageFormat, StorageSource, StorageType};

use super::xml::{parse_uint, yes_no, Element, XmlWriter};

/// Write `src` as element `name` with its whole backing chain.
pub fn write_source(w: &mut XmlWriter, name: &str, src: &StorageSource, extra: &[(&str, String)]) {
    if !src.is_backing() {
        w.empty(name, extra);
        return;
    }

    let mut attrs = vec![("type", src.storage_type.as_str().to_string())];
    attrs.extend(extra.iter().cloned());
    w.open(name, &attrs);
    write_source_body(w, src, true);
    w.close(name);
}

/// Write the children describing `src`.
///
/// Used directly for elements that carry the source type themselves
/// (`<disk>`, `<mirror>`). Without `with_format` the caller is expected
/// to record the format as an attribute.
pub fn write_source_body(w: &mut XmlWriter, src: &StorageSource, with_format: bool) {
    if with_format && src.format != StorageFormat::Auto {
        w.empty("format", &[("type", src.format.as_str().to_string())]);
    }

    write_source_location(w, src);

    if src.readonly {
        w.empty("readonly", &[]);
    }
    if src.shared {
        w.empty("shareable", &[]);
    }

    match src.backing_store.as_deref() {
        None => {}
        Some(backing) => write_source(w, "backingStore", backing, &[]),
    }
}

fn write_source_location(w: &mut XmlWriter, src: &StorageSource) {
    let mut attrs: Vec<(&str, String)> = Vec::new();
    let location = match src.storage_type {
        StorageType::File => Some("file"),
        StorageType::Block => Some("dev"),
        StorageType::Dir => Some("dir"),
        StorageType::Volume => Some("volume"),
        _ => None,
    };
    if let (Some(key), Some(path)) = (location, &src.path) {
        attrs.push((key, path.clone()));
    }

    match src.storage_type {
        StorageType::Network => {
            if let Some(protocol) = &src.protocol {
                attrs.push(("protocol", protocol.clone()));
            }
            if let Some(name) = &src.path {
                attrs.push(("name", name.clone()));
            }
        }
        StorageType::Nvme => {
            if let Some(nvme) = &src.nvme {
                attrs.push(("type", "pci".to_string()));
                attrs.push(("managed", yes_no(nvme.managed)));
                attrs.push(("namespace", nvme.namespace.to_string()));
            }
        }
        _ => {}
    }
    if src.id != 0 {
        attrs.push(("index", src.id.to_string()));
    }

    let has_private = src.node_storage.is_some()
        || src.node_format.is_some()
        || src
            .private
            .as_ref()
            .is_some_and(|p| p.secinfo.is_some() || p.encinfo.is_some());
    let nvme = src.nvme.as_ref().filter(|_| src.storage_type == StorageType::Nvme);

    if !has_private && nvme.is_none() {
        w.empty("source", &attrs);
        return;
    }

    w.open("source", &attrs);
    if let Some(nvme) = nvme {
        w.empty(
            "address",
            &[
                ("domain", format!("0x{:04x}", nvme.domain)),
                ("bus", format!("0x{:02x}", nvme.bus)),
                ("slot", format!("0x{:02x}", nvme.slot)),
                ("function", format!("0x{:x}", nvme.function)),
            ],
        );
    }
    if has_private {
        write_private_data(w, src);
    }
    w.close("source");
}

fn write_private_data(w: &mut XmlWriter, src: &StorageSource) {
    w.open("privateData", &[]);

    if src.node_storage.is_some() || src.node_format.is_some() {
        w.open("nodenames", &[]);
        if let Some(node) = &src.node_storage {
            w.empty("nodename", &[("type", "storage".to_string()), ("name", node.clone())]);
        }
        if let Some(node) = &src.node_format {
            w.empty("nodename", &[("type", "format".to_string()), ("name", node.clone())]);
        }
        w.close("nodenames");
    }

    if let Some(private) = &src.private {
        if private.secinfo.is_some() || private.encinfo.is_some() {
            w.open("objects", &[]);
            if let Some(alias) = &private.secinfo {
                w.empty("secret", &[("type", "auth".to_string()), ("alias", alias.clone())]);
            }
            if let Some(alias) = &private.encinfo {
                w.empty("secret", &[("type", "encryption".to_string()), ("alias", alias.clone())]);
            }
            w.close("objects");
        }
    }

    w.close("privateData");
}

/// Parse a source element carrying a `type` attribute.
///
/// `disk` names the owning disk in depth errors.
pub fn parse_source(el: &Element, disk: &str) -> Result<StorageSource> {
    let storage_type = match el.attr("type") {
        None => return Ok(StorageSource::empty()),
        Some(t) => StorageType::parse(t)
            .ok_or_else(|| BlockJobError::Xml(format!("unknown storage type '{}'", t)))?,
    };
    parse_source_as(el, storage_type, disk)
}

/// Parse the children of an element describing a source of known type.
pub fn parse_source_as(el: &Element, storage_type: StorageType, disk: &str) -> Result<StorageSource> {
    parse_layer(el, storage_type, disk, 1)
}

fn parse_layer(el: &Element, storage_type: StorageType, disk: &str, depth: usize) -> Result<StorageSource> {
    let mut src = StorageSource {
        storage_type,
        ..Default::default()
    };
    if storage_type == StorageType::None {
        return Ok(src);
    }

    if depth > MAX_CHAIN_DEPTH {
        return Err(BlockJobError::ChainTooDeep {
            disk: disk.to_string(),
            max: MAX_CHAIN_DEPTH,
        });
    }

    let format = el
        .child("format")
        .and_then(|f| f.attr("type"))
        .or_else(|| el.attr("format"));
    if let Some(format) = format {
        src.format = StorageFormat::parse(format)
            .ok_or_else(|| BlockJobError::Xml(format!("unknown storage format '{}'", format)))?;
    }

    if let Some(source) = el.child("source") {
        parse_location(source, &mut src)?;
    }

    src.readonly = el.has_child("readonly");
    src.shared = el.has_child("shareable");

    if let Some(backing) = el.child("backingStore") {
        let backing_type = match backing.attr("type") {
            None => StorageType::None,
            Some(t) => StorageType::parse(t)
                .ok_or_else(|| BlockJobError::Xml(format!("unknown storage type '{}'", t)))?,
        };
        src.backing_store = Some(Box::new(parse_layer(backing, backing_type, disk, depth + 1)?));
    }

    Ok(src)
}

fn parse_location(source: &Element, src: &mut StorageSource) -> Result<()> {
    match src.storage_type {
        StorageType::File => src.path = source.attr("file").map(str::to_string),
        StorageType::Block => src.path = source.attr("dev").map(str::to_string),
        StorageType::Dir => src.path = source.attr("dir").map(str::to_string),
        StorageType::Volume => src.path = source.attr("volume").map(str::to_string),
        StorageType::Network => {
            src.protocol = source.attr("protocol").map(str::to_string);
            src.path = source.attr("name").map(str::to_string);
        }
        StorageType::Nvme => src.nvme = Some(parse_nvme(source)?),
        StorageType::None => {}
    }

    if let Some(index) = source.attr("index") {
        src.id = index
            .parse()
            .map_err(|_| BlockJobError::Xml(format!("invalid source index '{}'", index)))?;
    }

    if let Some(private) = source.child("privateData") {
        if let Some(nodenames) = private.child("nodenames") {
            for node in nodenames.children_named("nodename") {
                let name = node.attr("name").map(str::to_string);
                match node.attr("type") {
                    Some("storage") => src.node_storage = name,
                    Some("format") => src.node_format = name,
                    _ => {}
                }
            }
        }

        if let Some(objects) = private.child("objects") {
            let mut data = SourcePrivate::default();
            for secret in objects.children_named("secret") {
                let alias = secret.attr("alias").map(str::to_string);
                match secret.attr("type") {
                    Some("auth") => data.secinfo = alias,
                    Some("encryption") => data.encinfo = alias,
                    _ => {}
                }
            }
            if data != SourcePrivate::default() {
                src.private = Some(data);
            }
        }
    }

    Ok(())
}

fn parse_nvme(source: &Element) -> Result<NvmeAddress> {
    let address = source
        .child("address")
        .ok_or_else(|| BlockJobError::Xml("nvme source without address".to_string()))?;

    let field = |name: &str| -> Result<u64> {
        address
            .attr(name)
            .and_then(parse_uint)
            .ok_or_else(|| BlockJobError::Xml(format!("invalid nvme address field '{}'", name)))
    };

    let namespace = source
        .attr("namespace")
        .and_then(parse_uint)
        .ok_or_else(|| BlockJobError::Xml("nvme source without namespace".to_string()))?;

    Ok(NvmeAddress {
        domain: field("domain")? as u16,
        bus: field("bus")? as u8,
        slot: field("slot")? as u8,
        function: field("function")? as u8,
        namespace: namespace as u32,
        managed: source.attr_bool("managed").unwrap_or(true),
    })
}
