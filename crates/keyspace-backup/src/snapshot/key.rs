//! Object-store key layout for snapshot artifacts.
//!
//! `/<base_path>/<keyspace>/<parent>/<snapshot>/<host><relative_path>.gz`
//!
//! A full snapshot is its own parent. The relative path is the captured
//! file's absolute path with the capture directories removed, so the same
//! table file lands at the same relative path whichever way it was taken.

use crate::error::{Error, Result};
use crate::snapshot::SnapshotId;

pub const COMPRESSION_EXT: &str = ".gz";

/// Trailing directory levels dropped from a full-snapshot file path
/// (`snapshots/<tag>`).
const FULL_CAPTURE_DEPTH: usize = 2;
/// Trailing directory levels dropped from an incremental file path (`backups`).
const INCREMENTAL_CAPTURE_DEPTH: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub base_path: String,
    pub keyspace: String,
}

impl Scope {
    pub fn new(base_path: &str, keyspace: &str) -> Result<Self> {
        let base_path = base_path.trim().trim_matches('/').to_string();
        let keyspace = keyspace.trim().to_string();
        if base_path.is_empty() {
            return Err(Error::config("store base path is empty"));
        }
        if keyspace.is_empty() || keyspace.contains('/') {
            return Err(Error::config(format!("invalid keyspace '{keyspace}'")));
        }
        Ok(Self {
            base_path,
            keyspace,
        })
    }

    /// Listing prefix, without the leading `/` that stores normalise away.
    pub fn list_prefix(&self) -> String {
        format!("{}/{}/", self.base_path, self.keyspace)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedKey {
    pub parent: SnapshotId,
    pub snapshot: SnapshotId,
    pub host: String,
    /// Always starts with `/`.
    pub relative_path: String,
}

impl DecodedKey {
    pub fn is_incremental(&self) -> bool {
        self.parent != self.snapshot
    }
}

#[derive(Debug, Clone)]
pub struct KeyCodec {
    scope: Scope,
}

impl KeyCodec {
    pub fn new(scope: Scope) -> Self {
        Self { scope }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn encode(
        &self,
        parent: &SnapshotId,
        snapshot: &SnapshotId,
        host: &str,
        file_path: &str,
        incremental: bool,
    ) -> Result<String> {
        let host = host.trim();
        if host.is_empty() || host.contains('/') {
            return Err(Error::msg(format!("invalid host '{host}' for artifact key")));
        }
        let relative = relative_file_path(file_path, incremental)?;
        Ok(format!(
            "/{}/{}/{}/{}/{}{}{}",
            self.scope.base_path,
            self.scope.keyspace,
            parent,
            snapshot,
            host,
            relative,
            COMPRESSION_EXT
        ))
    }

    pub fn decode(&self, key: &str) -> Result<DecodedKey> {
        let prefix = self.scope.list_prefix();
        let rest = key
            .trim_start_matches('/')
            .strip_prefix(prefix.as_str())
            .ok_or_else(|| Error::chain_decode(key, format!("not under scope '{prefix}'")))?;
        let rest = rest.strip_suffix(COMPRESSION_EXT).unwrap_or(rest);

        let parts = rest.splitn(4, '/').collect::<Vec<_>>();
        for (i, what) in ["parent", "snapshot", "host", "file path"].iter().enumerate() {
            if parts.get(i).is_none_or(|s| s.is_empty()) {
                return Err(Error::chain_decode(key, format!("missing {what} segment")));
            }
        }

        let parent =
            SnapshotId::parse(parts[0]).map_err(|e| Error::chain_decode(key, e.to_string()))?;
        let snapshot =
            SnapshotId::parse(parts[1]).map_err(|e| Error::chain_decode(key, e.to_string()))?;

        Ok(DecodedKey {
            parent,
            snapshot,
            host: parts[2].to_string(),
            relative_path: format!("/{}", parts[3]),
        })
    }
}

/// Strip the capture directories from an absolute captured file path.
pub fn relative_file_path(file_path: &str, incremental: bool) -> Result<String> {
    let segments = file_path
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>();
    let depth = if incremental {
        INCREMENTAL_CAPTURE_DEPTH
    } else {
        FULL_CAPTURE_DEPTH
    };
    // file name + capture dirs + at least one directory to keep
    if segments.len() < depth + 2 {
        return Err(Error::msg(format!(
            "captured file path '{file_path}' is too shallow for a {} capture",
            if incremental { "incremental" } else { "full" }
        )));
    }
    let (dirs, name) = segments.split_at(segments.len() - 1);
    let kept = &dirs[..dirs.len() - depth];
    Ok(format!("/{}/{}", kept.join("/"), name[0]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> KeyCodec {
        KeyCodec::new(Scope::new("/prod/", "ks").unwrap())
    }

    fn id(s: &str) -> SnapshotId {
        SnapshotId::parse(s).unwrap()
    }

    #[test]
    fn full_snapshot_drops_snapshot_tag_dirs() {
        let key = codec()
            .encode(
                &id("t1"),
                &id("t1"),
                "10.0.0.1",
                "/var/lib/cassandra/data/ks/users-1a2b/snapshots/t1/nb-1-big-Data.db",
                false,
            )
            .unwrap();
        assert_eq!(
            key,
            "/prod/ks/t1/t1/10.0.0.1/var/lib/cassandra/data/ks/users-1a2b/nb-1-big-Data.db.gz"
        );
    }

    #[test]
    fn incremental_drops_backups_dir() {
        let key = codec()
            .encode(
                &id("t1"),
                &id("t2"),
                "10.0.0.1",
                "/var/lib/cassandra/data/ks/users-1a2b/backups/nb-2-big-Data.db",
                true,
            )
            .unwrap();
        assert_eq!(
            key,
            "/prod/ks/t1/t2/10.0.0.1/var/lib/cassandra/data/ks/users-1a2b/nb-2-big-Data.db.gz"
        );
    }

    #[test]
    fn decode_recovers_structural_fields() {
        let c = codec();
        for (parent, snap, inc) in [("t1", "t1", false), ("t1", "t2", true)] {
            let file = if inc {
                "/data/ks/tbl/backups/f.db"
            } else {
                "/data/ks/tbl/snapshots/t1/f.db"
            };
            let key = c.encode(&id(parent), &id(snap), "hostA", file, inc).unwrap();
            let d = c.decode(&key).unwrap();
            assert_eq!(d.parent, id(parent));
            assert_eq!(d.snapshot, id(snap));
            assert_eq!(d.is_incremental(), inc);
            assert_eq!(d.host, "hostA");
            assert_eq!(d.relative_path, "/data/ks/tbl/f.db");
        }
    }

    #[test]
    fn decode_tolerates_missing_leading_slash_and_suffix() {
        let d = codec().decode("prod/ks/t1/t2/hostA/cf/f2").unwrap();
        assert_eq!(d.parent.as_str(), "t1");
        assert_eq!(d.snapshot.as_str(), "t2");
        assert_eq!(d.relative_path, "/cf/f2");
    }

    #[test]
    fn decode_rejects_malformed_keys() {
        let c = codec();
        assert!(matches!(
            c.decode("/other/ks/t1/t1/h/f.gz"),
            Err(Error::ChainDecode { .. })
        ));
        assert!(matches!(
            c.decode("/prod/ks/t1/t1/h"),
            Err(Error::ChainDecode { .. })
        ));
        assert!(matches!(
            c.decode("/prod/ks/t1//h/f.gz"),
            Err(Error::ChainDecode { .. })
        ));
    }

    #[test]
    fn shallow_paths_are_rejected() {
        assert!(relative_file_path("/snapshots/t1/f.db", false).is_err());
        assert!(relative_file_path("/backups/f.db", true).is_err());
        assert_eq!(relative_file_path("/t/backups/f.db", true).unwrap(), "/t/f.db");
    }
}
