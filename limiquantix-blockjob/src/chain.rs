//! Backing chain helpers.

use tracing::debug;

use crate::error::{BlockJobError, Result};
use crate::types::StorageSource;

/// Maximum number of layers a backing chain may have.
///
/// Deeper nesting can't be stored reliably in the status XML.
pub const MAX_CHAIN_DEPTH: usize = 200;

/// Number of data-carrying layers in the chain starting at `src`.
pub fn chain_depth(src: &StorageSource) -> usize {
    src.chain().count()
}

/// Check that the chain of `disk` stays within [`MAX_CHAIN_DEPTH`] once
/// `add` more layers are put on top of it.
pub fn validate_depth(src: &StorageSource, add: usize, disk: &str) -> Result<()> {
    let nlayers = chain_depth(src) + add;

    if nlayers > MAX_CHAIN_DEPTH {
        return Err(BlockJobError::ChainTooDeep {
            disk: disk.to_string(),
            max: MAX_CHAIN_DEPTH,
        });
    }

    Ok(())
}

/// Find the layer whose format or storage node is called `node_name`.
pub fn find_by_node_name<'a>(src: &'a StorageSource, node_name: &str) -> Option<&'a StorageSource> {
    src.chain().find(|layer| {
        layer.node_format.as_deref() == Some(node_name)
            || layer.node_storage.as_deref() == Some(node_name)
    })
}

/// Find the layer with the given path.
pub fn find_by_path<'a>(src: &'a StorageSource, path: &str) -> Option<&'a StorageSource> {
    src.chain().find(|layer| layer.path.as_deref() == Some(path))
}

/// Mutable access to every data-carrying layer of the chain.
pub fn for_each_layer_mut(src: &mut StorageSource, mut f: impl FnMut(&mut StorageSource)) {
    let mut cur = Some(src);
    while let Some(layer) = cur {
        if !layer.is_backing() {
            break;
        }
        f(layer);
        cur = layer.backing_store.as_deref_mut();
    }
}

/// Forget everything known about the backing chain of `src` so it gets
/// probed again.
pub fn backing_store_clear(src: &mut StorageSource) {
    src.backing_store = None;
}

/// Prepare `new` to replace `old` as an element of a chain.
///
/// Access mode is inherited and, with `transfer_private`, also the secret
/// aliases, so that the replacement ends up configured like its
/// predecessor.
pub fn init_chain_element(new: &mut StorageSource, old: &StorageSource, transfer_private: bool) {
    new.readonly = old.readonly;
    new.shared = old.shared;

    if transfer_private {
        new.private = old.private.clone();
    }
}

/// Number the layers of a chain starting at `start`.
pub fn assign_indexes(src: &mut StorageSource, start: u32) {
    let mut idx = start;
    for_each_layer_mut(src, |layer| {
        layer.id = idx;
        idx += 1;
    });
    debug!(layers = idx - start, "Assigned backing chain indexes");
}

#[cfg(test)]
pub(crate) fn build_chain(depth: usize) -> StorageSource {
    let mut chain = StorageSource::empty();
    for i in (0..depth).rev() {
        chain = StorageSource::file(format!("/img/layer{}.qcow2", i))
            .with_node_names(format!("storage{}", i), format!("format{}", i))
            .with_backing(chain);
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_boundary() {
        let chain = build_chain(MAX_CHAIN_DEPTH);
        assert_eq!(chain_depth(&chain), 200);
        assert!(validate_depth(&chain, 0, "vda").is_ok());

        let err = validate_depth(&chain, 1, "vda").unwrap_err();
        assert!(matches!(err, BlockJobError::ChainTooDeep { max: 200, .. }));

        let too_deep = build_chain(MAX_CHAIN_DEPTH + 1);
        assert!(validate_depth(&too_deep, 0, "vda").is_err());
        assert!(validate_depth(&too_deep, 1, "vda").is_err());

        let shallow = build_chain(MAX_CHAIN_DEPTH - 1);
        assert!(validate_depth(&shallow, 1, "vda").is_ok());
    }

    #[test]
    fn test_find_by_node_name() {
        let chain = build_chain(3);

        let found = find_by_node_name(&chain, "format2").unwrap();
        assert_eq!(found.path.as_deref(), Some("/img/layer2.qcow2"));
        assert!(find_by_node_name(&chain, "storage0").is_some());
        assert!(find_by_node_name(&chain, "format3").is_none());

        assert_eq!(
            find_by_path(&chain, "/img/layer1.qcow2").and_then(|l| l.node_format.as_deref()),
            Some("format1")
        );
        assert!(find_by_path(&chain, "/img/missing.qcow2").is_none());
    }

    #[test]
    fn test_assign_indexes() {
        let mut chain = build_chain(3);
        assign_indexes(&mut chain, 1);

        let ids: Vec<u32> = chain.chain().map(|l| l.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_init_chain_element_inherits_access_mode() {
        let mut old = StorageSource::file("/old").with_readonly(true);
        old.shared = true;
        old.private_mut().secinfo = Some("libvirt-1-storage-secret0".to_string());

        let mut new = StorageSource::file("/new");
        init_chain_element(&mut new, &old, true);

        assert!(new.readonly);
        assert!(new.shared);
        assert_eq!(new.private, old.private);
    }
}
