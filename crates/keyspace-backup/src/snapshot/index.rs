use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::snapshot::{KeyCodec, SnapshotId};

/// One snapshot's own artifacts, as returned by [`ChainIndex::layers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    pub snapshot: SnapshotId,
    pub keys: Vec<String>,
}

/// Parent links and artifact sets for every snapshot under one scope,
/// rebuilt from the store listing on each run.
#[derive(Debug, Clone)]
pub struct ChainIndex {
    codec: KeyCodec,
    parent_of: BTreeMap<SnapshotId, SnapshotId>,
    artifacts_of: BTreeMap<SnapshotId, BTreeSet<String>>,
}

impl ChainIndex {
    pub fn new(codec: KeyCodec) -> Self {
        Self {
            codec,
            parent_of: BTreeMap::new(),
            artifacts_of: BTreeMap::new(),
        }
    }

    pub fn from_keys<I, S>(codec: KeyCodec, keys: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut index = Self::new(codec);
        for key in keys {
            index.add(key.as_ref())?;
        }
        Ok(index)
    }

    pub fn codec(&self) -> &KeyCodec {
        &self.codec
    }

    pub fn add(&mut self, key: &str) -> Result<()> {
        let decoded = self.codec.decode(key)?;
        if decoded.is_incremental() {
            match self.parent_of.get(&decoded.snapshot) {
                Some(existing) if *existing != decoded.parent => {
                    return Err(Error::chain_decode(
                        key,
                        format!(
                            "snapshot '{}' already recorded with parent '{}'",
                            decoded.snapshot, existing
                        ),
                    ));
                }
                Some(_) => {}
                None => {
                    // A full layer for the same id would make it both a root and a child.
                    if self.is_root_with_artifacts(&decoded.snapshot) {
                        return Err(Error::chain_decode(
                            key,
                            format!("snapshot '{}' is already a full snapshot", decoded.snapshot),
                        ));
                    }
                    self.parent_of
                        .insert(decoded.snapshot.clone(), decoded.parent.clone());
                }
            }
        } else if self.parent_of.contains_key(&decoded.snapshot) {
            return Err(Error::chain_decode(
                key,
                format!(
                    "snapshot '{}' is already an incremental snapshot",
                    decoded.snapshot
                ),
            ));
        }
        self.artifacts_of
            .entry(decoded.snapshot)
            .or_default()
            .insert(key.to_string());
        Ok(())
    }

    fn is_root_with_artifacts(&self, id: &SnapshotId) -> bool {
        self.artifacts_of.contains_key(id) && !self.parent_of.contains_key(id)
    }

    pub fn list(&self) -> Vec<SnapshotId> {
        self.artifacts_of.keys().cloned().collect()
    }

    pub fn latest(&self) -> Option<SnapshotId> {
        self.artifacts_of.keys().next_back().cloned()
    }

    pub fn valid(&self, id: &SnapshotId) -> bool {
        self.artifacts_of.get(id).is_some_and(|keys| !keys.is_empty())
    }

    /// Immediate parent, or `id` itself for a full snapshot.
    pub fn parent_of(&self, id: &SnapshotId) -> SnapshotId {
        self.parent_of.get(id).cloned().unwrap_or_else(|| id.clone())
    }

    pub fn artifact_count(&self, id: &SnapshotId) -> usize {
        self.artifacts_of.get(id).map(BTreeSet::len).unwrap_or(0)
    }

    /// Every key needed to rebuild `id`, across the whole chain.
    pub fn resolve(&self, id: &SnapshotId) -> Result<BTreeSet<String>> {
        let mut out = BTreeSet::new();
        for layer in self.layers(id)? {
            out.extend(layer.keys);
        }
        Ok(out)
    }

    /// The chain for `id`, oldest (root) layer first. Restores write layers
    /// in this order so a child's copy of a file replaces its parent's.
    pub fn layers(&self, id: &SnapshotId) -> Result<Vec<Layer>> {
        let mut seen = BTreeSet::<&SnapshotId>::new();
        let mut layers = Vec::new();
        let mut cur = id;
        loop {
            if !seen.insert(cur) {
                return Err(Error::ChainCycle {
                    snapshot: cur.to_string(),
                });
            }
            let keys = self
                .artifacts_of
                .get(cur)
                .filter(|keys| !keys.is_empty())
                .ok_or_else(|| Error::UnknownSnapshot(cur.to_string()))?;
            layers.push(Layer {
                snapshot: cur.clone(),
                keys: keys.iter().cloned().collect(),
            });
            match self.parent_of.get(cur) {
                Some(parent) => cur = parent,
                None => break,
            }
        }
        layers.reverse();
        Ok(layers)
    }

    /// Text tree of every snapshot, incrementals nested under their parent.
    pub fn render_tree(&self) -> String {
        let mut children = BTreeMap::<&SnapshotId, Vec<&SnapshotId>>::new();
        let mut roots = Vec::new();
        for id in self.artifacts_of.keys() {
            match self.parent_of.get(id) {
                Some(parent) if self.artifacts_of.contains_key(parent) && parent != id => {
                    children.entry(parent).or_default().push(id)
                }
                Some(parent) => {
                    // Parent is gone from the store; show it so the break is visible.
                    roots.push((id, Some(parent)));
                }
                None => roots.push((id, None)),
            }
        }

        let mut out = String::new();
        let mut visited = BTreeSet::<&SnapshotId>::new();
        for (id, missing_parent) in roots {
            let mut stack = vec![(id, 0usize, missing_parent)];
            while let Some((cur, depth, missing)) = stack.pop() {
                if !visited.insert(cur) {
                    continue;
                }
                out.push_str(&"     ".repeat(depth));
                out.push_str("+-- ");
                out.push_str(cur.as_str());
                out.push_str(&format!(" ({} files)", self.artifact_count(cur)));
                if let Some(p) = missing {
                    out.push_str(&format!(" [missing parent {p}]"));
                }
                out.push('\n');
                if let Some(kids) = children.get(cur) {
                    for kid in kids.iter().rev() {
                        stack.push((*kid, depth + 1, None));
                    }
                }
            }
        }
        for id in self.artifacts_of.keys() {
            if !visited.contains(id) {
                out.push_str(&format!("+-- {id} [parent cycle]\n"));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Scope;

    fn codec() -> KeyCodec {
        KeyCodec::new(Scope::new("env", "ks").unwrap())
    }

    fn id(s: &str) -> SnapshotId {
        SnapshotId::parse(s).unwrap()
    }

    fn two_layer_index() -> ChainIndex {
        ChainIndex::from_keys(
            codec(),
            ["/env/ks/t1/t1/hostA/cf/snap/f1.gz", "/env/ks/t1/t2/hostA/cf/f2.gz"],
        )
        .unwrap()
    }

    #[test]
    fn two_layer_chain_behaviour() {
        let h = two_layer_index();
        assert_eq!(h.list(), vec![id("t1"), id("t2")]);
        assert!(h.valid(&id("t2")));
        assert!(!h.valid(&id("t3")));
        let keys = h.resolve(&id("t2")).unwrap();
        assert!(keys.contains("/env/ks/t1/t2/hostA/cf/f2.gz"));
        assert!(keys.contains("/env/ks/t1/t1/hostA/cf/snap/f1.gz"));
        assert_eq!(keys.len(), 2);
        assert_eq!(h.parent_of(&id("t1")), id("t1"));
        assert_eq!(h.parent_of(&id("t2")), id("t1"));
        assert_eq!(h.latest(), Some(id("t2")));
    }

    #[test]
    fn root_resolves_to_its_own_artifacts() {
        let h = two_layer_index();
        let keys = h.resolve(&id("t1")).unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys.contains("/env/ks/t1/t1/hostA/cf/snap/f1.gz"));
    }

    #[test]
    fn adding_same_key_twice_is_idempotent() {
        let mut h = two_layer_index();
        h.add("/env/ks/t1/t2/hostA/cf/f2.gz").unwrap();
        assert_eq!(h.artifact_count(&id("t2")), 1);
        assert_eq!(h.list().len(), 2);
    }

    #[test]
    fn layers_are_root_first() {
        let mut h = two_layer_index();
        h.add("/env/ks/t2/t3/hostA/cf/f3.gz").unwrap();
        let order = h
            .layers(&id("t3"))
            .unwrap()
            .into_iter()
            .map(|l| l.snapshot)
            .collect::<Vec<_>>();
        assert_eq!(order, vec![id("t1"), id("t2"), id("t3")]);
    }

    #[test]
    fn missing_ancestor_is_reported() {
        let h = ChainIndex::from_keys(codec(), ["/env/ks/t0/t2/hostA/cf/f2.gz"]).unwrap();
        assert!(h.valid(&id("t2")));
        match h.resolve(&id("t2")) {
            Err(Error::UnknownSnapshot(s)) => assert_eq!(s, "t0"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn cyclic_parents_are_detected() {
        let h = ChainIndex::from_keys(
            codec(),
            ["/env/ks/t2/t1/hostA/cf/a.gz", "/env/ks/t1/t2/hostA/cf/b.gz"],
        )
        .unwrap();
        assert!(matches!(h.resolve(&id("t2")), Err(Error::ChainCycle { .. })));
    }

    #[test]
    fn conflicting_parents_fail_fast() {
        let mut h = two_layer_index();
        let err = h.add("/env/ks/t0/t2/hostB/cf/x.gz").unwrap_err();
        assert!(matches!(err, Error::ChainDecode { .. }));
        let err = h.add("/env/ks/t2/t2/hostB/cf/snap/x.gz").unwrap_err();
        assert!(matches!(err, Error::ChainDecode { .. }));
    }

    #[test]
    fn malformed_key_is_an_error() {
        let mut h = ChainIndex::new(codec());
        assert!(matches!(
            h.add("/env/ks/t1"),
            Err(Error::ChainDecode { .. })
        ));
        assert!(h.list().is_empty());
    }

    #[test]
    fn tree_nests_incrementals() {
        let mut h = two_layer_index();
        h.add("/env/ks/t3/t3/hostA/cf/snap/f.gz").unwrap();
        let tree = h.render_tree();
        assert_eq!(
            tree,
            "+-- t1 (1 files)\n     +-- t2 (1 files)\n+-- t3 (1 files)\n"
        );
    }
}
