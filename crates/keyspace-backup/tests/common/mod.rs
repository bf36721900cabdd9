#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use keyspace_backup::collab::{
    ByteStream, Capture, ClusterControl, EntryKind, ObjectStore, RemoteAgent,
};
use keyspace_backup::snapshot::{KeyCodec, Scope, SnapshotId};
use keyspace_backup::store::LocalStore;
use keyspace_backup::{Error, Result};

pub const DATA_DIR: &str = "/var/lib/cassandra/data/ks";

pub fn codec() -> KeyCodec {
    KeyCodec::new(Scope::new("prod", "ks").expect("scope"))
}

pub fn id(s: &str) -> SnapshotId {
    SnapshotId::parse(s).expect("snapshot id")
}

/// Ring of nodes whose tables hold a fixed set of sstable names.
#[derive(Default)]
pub struct FakeCluster {
    pub hosts: Vec<String>,
    /// host -> table dir -> file names
    pub tables: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    pub failing_captures: BTreeSet<String>,
    pub failing_load_targets: BTreeSet<String>,
    pub captures: Mutex<Vec<(String, bool)>>,
    pub loads: Mutex<Vec<(String, String, String)>>,
}

impl FakeCluster {
    pub fn new(hosts: &[&str]) -> Self {
        Self {
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn with_table(mut self, host: &str, table: &str, files: &[&str]) -> Self {
        self.tables
            .entry(host.to_string())
            .or_default()
            .insert(
                format!("{DATA_DIR}/{table}"),
                files.iter().map(|f| f.to_string()).collect(),
            );
        self
    }

    fn capture(&self, host: &str, sub: &str, incremental: bool) -> Result<Capture> {
        self.captures
            .lock()
            .unwrap()
            .push((host.to_string(), incremental));
        if self.failing_captures.contains(host) {
            return Err(Error::msg(format!("nodetool unreachable on {host}")));
        }
        let mut cap = Capture::default();
        for (table, files) in self.tables.get(host).into_iter().flatten() {
            let dir = format!("{table}/{sub}");
            cap.files
                .extend(files.iter().map(|f| format!("{dir}/{f}")));
            cap.dirs.push(dir);
        }
        Ok(cap)
    }
}

impl ClusterControl for FakeCluster {
    fn list_live_hosts(&self) -> Result<Vec<String>> {
        Ok(self.hosts.clone())
    }

    fn capture_full(&self, host: &str, snapshot: &SnapshotId) -> Result<Capture> {
        self.capture(host, &format!("snapshots/{snapshot}"), false)
    }

    fn capture_incremental(&self, host: &str) -> Result<Capture> {
        self.capture(host, "backups", true)
    }

    fn bulk_load(&self, from_host: &str, target_node: &str, directory: &str) -> Result<()> {
        self.loads.lock().unwrap().push((
            from_host.to_string(),
            target_node.to_string(),
            directory.to_string(),
        ));
        if self.failing_load_targets.contains(target_node) {
            return Err(Error::msg(format!("stream to {target_node} refused")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub host: String,
    pub remote_dir: String,
    pub file_name: String,
    pub body: String,
}

/// Remote files read back as `<host>:<path>`; transfers and removals recorded.
#[derive(Default)]
pub struct FakeAgent {
    pub reads: AtomicUsize,
    pub transfers: Mutex<Vec<Transfer>>,
    pub removed: Mutex<Vec<(String, Vec<String>)>>,
}

impl RemoteAgent for FakeAgent {
    fn run_command(&self, host: &str, cmd: &str) -> Result<String> {
        Err(Error::msg(format!("unexpected command on {host}: {cmd}")))
    }

    fn list_entries(&self, _host: &str, _dir: &str, _kind: EntryKind) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn read_file(&self, host: &str, path: &str) -> Result<ByteStream> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(std::io::Cursor::new(format!("{host}:{path}").into_bytes())))
    }

    fn transfer_file(&self, host: &str, local_path: &Path, remote_dir: &str) -> Result<()> {
        let body = fs::read_to_string(local_path)
            .map_err(|e| Error::msg(format!("read {}: {e}", local_path.display())))?;
        self.transfers.lock().unwrap().push(Transfer {
            host: host.to_string(),
            remote_dir: remote_dir.to_string(),
            file_name: local_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            body,
        });
        Ok(())
    }

    fn remove_dirs(&self, host: &str, dirs: &[String]) -> Result<()> {
        self.removed
            .lock()
            .unwrap()
            .push((host.to_string(), dirs.to_vec()));
        Ok(())
    }
}

/// `LocalStore` that counts traffic.
pub struct CountingStore {
    pub inner: LocalStore,
    pub gets: AtomicUsize,
    pub puts: AtomicUsize,
}

impl CountingStore {
    pub fn new(root: &Path) -> Self {
        Self {
            inner: LocalStore::new(root).expect("local store"),
            gets: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
        }
    }

    /// Store `body` gzip-compressed under `key`, the way a backup writes it.
    pub fn seed(&self, key: &str, body: &str) {
        let gz = keyspace_backup::compress::gzip_stream(std::io::Cursor::new(body.as_bytes().to_vec()));
        self.inner.put_object(key, Box::new(gz)).expect("seed");
    }

    pub fn read(&self, key: &str) -> String {
        let mut out = String::new();
        flate2::read::GzDecoder::new(self.inner.get_object(key).expect("get"))
            .read_to_string(&mut out)
            .expect("gunzip");
        out
    }
}

impl ObjectStore for CountingStore {
    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list_keys(prefix)
    }

    fn put_object(&self, key: &str, body: ByteStream) -> Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put_object(key, body)
    }

    fn get_object(&self, key: &str) -> Result<ByteStream> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get_object(key)
    }
}
