use std::fmt::Write as _;

use crate::collab::ObjectStore;
use crate::error::{Error, Result};
use crate::snapshot::{ChainIndex, KeyCodec, SnapshotId};

/// Rebuild the chain index from the store listing for the codec's scope.
pub fn load_chain(store: &dyn ObjectStore, codec: &KeyCodec) -> Result<ChainIndex> {
    let prefix = codec.scope().list_prefix();
    let keys = store.list_keys(&prefix)?;
    tracing::debug!(%prefix, keys = keys.len(), "listed stored artifacts");
    ChainIndex::from_keys(codec.clone(), keys)
}

/// Tree of every snapshot, or the layers and keys behind one of them.
pub fn describe(index: &ChainIndex, snapshot: Option<&SnapshotId>) -> Result<String> {
    let Some(id) = snapshot else {
        if index.list().is_empty() {
            return Ok("no snapshots stored\n".to_string());
        }
        return Ok(index.render_tree());
    };
    if !index.valid(id) {
        return Err(Error::InvalidSnapshot(id.to_string()));
    }

    let layers = index.layers(id)?;
    let mut out = String::new();
    let _ = writeln!(out, "{id} (parent {})", index.parent_of(id));
    for layer in &layers {
        let _ = writeln!(out, "+-- {} ({} files)", layer.snapshot, layer.keys.len());
        for key in &layer.keys {
            let _ = writeln!(out, "     {key}");
        }
    }
    Ok(out)
}
