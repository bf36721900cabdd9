//! Rebuild a snapshot chain from the store and bulk-load it into the
//! live cluster.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::collab::{ClusterControl, ObjectStore, RemoteAgent};
use crate::compress::gunzip_to_file;
use crate::error::{Error, Result};
use crate::history::load_chain;
use crate::snapshot::index::Layer;
use crate::snapshot::key::COMPRESSION_EXT;
use crate::snapshot::{KeyCodec, SnapshotId};
use crate::store::object_name;

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Restore this snapshot instead of the latest one.
    pub snapshot: Option<SnapshotId>,
    pub dry_run: bool,
    pub keep_staging: bool,
    /// Local directory downloads are decompressed into.
    pub staging_dir: PathBuf,
    /// Directory on the loading host that staged files are copied to.
    pub remote_dir: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedLayer {
    pub snapshot: SnapshotId,
    pub keys: Vec<String>,
}

impl From<Layer> for PlannedLayer {
    fn from(l: Layer) -> Self {
        Self {
            snapshot: l.snapshot,
            keys: l.keys,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub target: SnapshotId,
    /// Root layer first.
    pub layers: Vec<PlannedLayer>,
    pub dry_run: bool,
    /// Host the staged files were copied to and loaded from.
    pub loaded_from: Option<String>,
    /// Table directories handed to the bulk loader, in load order.
    pub directories: Vec<String>,
}

impl RestoreReport {
    pub fn key_count(&self) -> usize {
        self.layers.iter().map(|l| l.keys.len()).sum()
    }
}

pub struct Restore<'a> {
    cluster: &'a dyn ClusterControl,
    agent: &'a dyn RemoteAgent,
    store: &'a dyn ObjectStore,
    codec: KeyCodec,
}

/// Where a downloaded key lands locally: the key without `.gz`.
pub fn staging_path(staging_dir: &Path, key: &str) -> PathBuf {
    let name = object_name(key);
    staging_dir.join(name.strip_suffix(COMPRESSION_EXT).unwrap_or(name))
}

fn parent_dir(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some((dir, _)) => dir,
        None => "",
    }
}

impl<'a> Restore<'a> {
    pub fn new(
        cluster: &'a dyn ClusterControl,
        agent: &'a dyn RemoteAgent,
        store: &'a dyn ObjectStore,
        codec: KeyCodec,
    ) -> Self {
        Self {
            cluster,
            agent,
            store,
            codec,
        }
    }

    pub fn run(&self, opts: &RestoreOptions) -> Result<RestoreReport> {
        let hosts = self.cluster.list_live_hosts()?;
        if hosts.is_empty() {
            return Err(Error::NoHostsFound);
        }

        let index = load_chain(self.store, &self.codec)?;
        let target = opts
            .snapshot
            .clone()
            .or_else(|| index.latest())
            .ok_or(Error::NoBackupAvailable)?;
        if !index.valid(&target) {
            return Err(Error::InvalidSnapshot(target.to_string()));
        }
        let layers = index.layers(&target)?;

        let mut report = RestoreReport {
            target: target.clone(),
            layers: layers.iter().cloned().map(PlannedLayer::from).collect(),
            dry_run: opts.dry_run,
            loaded_from: None,
            directories: Vec::new(),
        };
        tracing::info!(
            %target,
            layers = report.layers.len(),
            keys = report.key_count(),
            dry_run = opts.dry_run,
            "restore planned"
        );
        if opts.dry_run {
            return Ok(report);
        }

        let staged = self.download(&layers, &opts.staging_dir)?;

        let loader = hosts[0].as_str();
        report.directories = self.upload(loader, &staged, &opts.remote_dir)?;
        report.loaded_from = Some(loader.to_string());

        for dir in &report.directories {
            self.bulk_load(loader, &hosts, dir)?;
        }

        if !opts.keep_staging {
            self.clean_staging(loader, &staged, opts)?;
        }
        tracing::info!(%target, directories = report.directories.len(), "restore finished");
        Ok(report)
    }

    /// Download every layer, root first, so a file present in several
    /// layers ends up with the newest copy.
    fn download(&self, layers: &[Layer], staging_dir: &Path) -> Result<Vec<(String, PathBuf)>> {
        let mut staged = Vec::new();
        for layer in layers {
            tracing::info!(snapshot = %layer.snapshot, keys = layer.keys.len(), "downloading layer");
            for key in &layer.keys {
                let dest = staging_path(staging_dir, key);
                let reader = self.store.get_object(key)?;
                let n = gunzip_to_file(reader, &dest)
                    .map_err(|e| Error::msg(format!("staging {key}: {e}")))?;
                tracing::debug!(%key, bytes = n, dest = %dest.display(), "staged");
                staged.push((key.clone(), dest));
            }
        }
        Ok(staged)
    }

    /// Copy staged files to `loader` in download order, returning the
    /// distinct remote table directories in first-seen order. Each file
    /// lands under `<remote_dir>/<source host><table dir>`; the source host
    /// segment keeps same-named sstables from different nodes apart.
    fn upload(&self, loader: &str, staged: &[(String, PathBuf)], remote_dir: &str) -> Result<Vec<String>> {
        let remote_root = remote_dir.trim_end_matches('/');

        let source_roots = self.source_roots(staged, remote_root)?;
        self.agent
            .remove_dirs(loader, &source_roots)
            .map_err(|e| Error::cleanup_failed(loader, e))?;

        let mut seen = BTreeSet::<String>::new();
        let mut dirs = Vec::new();
        for (key, local) in staged {
            let decoded = self.codec.decode(key)?;
            let dir = format!(
                "{remote_root}/{}{}",
                decoded.host,
                parent_dir(&decoded.relative_path)
            );
            self.agent
                .transfer_file(loader, local, &dir)
                .map_err(|e| Error::upload_failed(loader, key, e))?;
            if seen.insert(dir.clone()) {
                dirs.push(dir);
            }
        }
        Ok(dirs)
    }

    /// `<remote_root>/<source host>` for every host that contributed files.
    fn source_roots(&self, staged: &[(String, PathBuf)], remote_root: &str) -> Result<Vec<String>> {
        let mut roots = BTreeSet::new();
        for (key, _) in staged {
            let host = self.codec.decode(key)?.host;
            roots.insert(format!("{remote_root}/{host}"));
        }
        Ok(roots.into_iter().collect())
    }

    /// Try each live node as the load target until one accepts the directory.
    fn bulk_load(&self, loader: &str, hosts: &[String], dir: &str) -> Result<()> {
        let mut last_err = None;
        for target in hosts {
            match self.cluster.bulk_load(loader, target, dir) {
                Ok(()) => {
                    tracing::info!(directory = dir, %target, "bulk load done");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(directory = dir, %target, error = %e, "bulk load failed; trying next node");
                    last_err = Some(e);
                }
            }
        }
        Err(Error::bulk_load_failed(
            dir,
            last_err.unwrap_or_else(|| Error::msg("no target nodes")),
        ))
    }

    fn clean_staging(&self, loader: &str, staged: &[(String, PathBuf)], opts: &RestoreOptions) -> Result<()> {
        let roots = self.source_roots(staged, opts.remote_dir.trim_end_matches('/'))?;
        self.agent
            .remove_dirs(loader, &roots)
            .map_err(|e| Error::cleanup_failed(loader, e))?;
        if opts.staging_dir.exists() {
            fs::remove_dir_all(&opts.staging_dir).map_err(|e| {
                Error::msg(format!(
                    "failed to remove staging dir {}: {e}",
                    opts.staging_dir.display()
                ))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_path_drops_compression_suffix() {
        assert_eq!(
            staging_path(Path::new("/tmp/s"), "/prod/ks/t1/t1/h/data/ks/tbl/f.db.gz"),
            PathBuf::from("/tmp/s/prod/ks/t1/t1/h/data/ks/tbl/f.db")
        );
    }

    #[test]
    fn parent_dir_of_relative_path() {
        assert_eq!(parent_dir("/data/ks/tbl/f.db"), "/data/ks/tbl");
        assert_eq!(parent_dir("f.db"), "");
    }
}
