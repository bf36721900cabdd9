//! Seams between the orchestrators and the outside world.

use std::io::Read;
use std::path::Path;

use crate::error::Result;
use crate::snapshot::SnapshotId;

pub type ByteStream = Box<dyn Read + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

impl EntryKind {
    pub fn find_type(self) -> &'static str {
        match self {
            Self::File => "f",
            Self::Dir => "d",
        }
    }
}

/// Files produced by one capture on one host, plus the directories to
/// remove once they are stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capture {
    pub files: Vec<String>,
    pub dirs: Vec<String>,
}

pub trait RemoteAgent: Send + Sync {
    /// Run a shell command on `host`, returning its standard output.
    fn run_command(&self, host: &str, cmd: &str) -> Result<String>;

    /// Direct children of `dir` of the given kind. Not recursive; empty when
    /// `dir` does not exist.
    fn list_entries(&self, host: &str, dir: &str, kind: EntryKind) -> Result<Vec<String>>;

    fn read_file(&self, host: &str, path: &str) -> Result<ByteStream>;

    /// Copy a local file into `remote_dir` on `host`, creating the directory.
    fn transfer_file(&self, host: &str, local_path: &Path, remote_dir: &str) -> Result<()>;

    /// Recursively delete directories on `host`.
    fn remove_dirs(&self, host: &str, dirs: &[String]) -> Result<()>;
}

pub trait ObjectStore: Send + Sync {
    /// Every key under `prefix`, across all result pages.
    fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Store `body` under `key`, consuming it as it is sent.
    fn put_object(&self, key: &str, body: ByteStream) -> Result<()>;

    fn get_object(&self, key: &str) -> Result<ByteStream>;
}

pub trait ClusterControl: Send + Sync {
    fn list_live_hosts(&self) -> Result<Vec<String>>;

    fn capture_full(&self, host: &str, snapshot: &SnapshotId) -> Result<Capture>;

    fn capture_incremental(&self, host: &str) -> Result<Capture>;

    /// Run the bulk loader on `from_host` for `directory`, streaming to `target_node`.
    fn bulk_load(&self, from_host: &str, target_node: &str, directory: &str) -> Result<()>;
}
