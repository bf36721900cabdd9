//! `ClusterControl` for a Cassandra ring, driven over a `RemoteAgent`.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Deserialize;

use crate::collab::{Capture, ClusterControl, EntryKind, RemoteAgent};
use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::log_sanitize::sanitize_output;
use crate::process::sh_quote;
use crate::snapshot::SnapshotId;

/// `UN`, `UL`, `UJ`, `UM` rows of `nodetool status`.
static LIVE_NODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^U[NLJM]\s+(\S+)").unwrap());

#[derive(Debug, Default, Deserialize)]
struct CassandraYaml {
    #[serde(default)]
    data_file_directories: Option<Vec<String>>,
}

pub struct CassandraCluster {
    agent: Arc<dyn RemoteAgent>,
    cfg: ClusterConfig,
}

impl CassandraCluster {
    pub fn new(agent: Arc<dyn RemoteAgent>, cfg: &ClusterConfig) -> Self {
        Self {
            agent,
            cfg: cfg.clone(),
        }
    }

    fn data_dirs(&self, host: &str) -> Result<Vec<String>> {
        if !self.cfg.data_dirs.is_empty() {
            return Ok(self.cfg.data_dirs.clone());
        }
        let path = format!(
            "{}/cassandra.yaml",
            self.cfg.cassandra_conf.trim_end_matches('/')
        );
        let raw = self
            .agent
            .run_command(host, &format!("cat -- {}", sh_quote(&path)))?;
        parse_data_dirs(&raw).map_err(|e| Error::msg(format!("{path} @ {host}: {e}")))
    }

    /// Files in `<data>/<keyspace>/<table>/<capture_dir>` for every table.
    /// Tables without the capture directory contribute nothing.
    fn collect(&self, host: &str, capture_dir: &str) -> Result<Capture> {
        let mut capture = Capture::default();
        for data_dir in self.data_dirs(host)? {
            let keyspace_dir = format!(
                "{}/{}",
                data_dir.trim_end_matches('/'),
                self.cfg.keyspace
            );
            for table in self.agent.list_entries(host, &keyspace_dir, EntryKind::Dir)? {
                let dir = format!("{}/{capture_dir}", table.trim_end_matches('/'));
                let files = self.agent.list_entries(host, &dir, EntryKind::File)?;
                if files.is_empty() {
                    continue;
                }
                capture.files.extend(files);
                capture.dirs.push(dir);
            }
        }
        tracing::debug!(
            host,
            files = capture.files.len(),
            tables = capture.dirs.len(),
            "capture listed"
        );
        Ok(capture)
    }
}

pub(crate) fn parse_live_hosts(status: &str) -> Vec<String> {
    status
        .lines()
        .filter_map(|line| LIVE_NODE.captures(line))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

pub(crate) fn parse_data_dirs(raw: &str) -> Result<Vec<String>> {
    let conf: CassandraYaml =
        serde_yaml::from_str(raw).map_err(|e| Error::msg(format!("invalid yaml: {e}")))?;
    match conf.data_file_directories {
        Some(dirs) if !dirs.is_empty() => Ok(dirs),
        _ => Err(Error::msg("data_file_directories is not set")),
    }
}

impl ClusterControl for CassandraCluster {
    fn list_live_hosts(&self) -> Result<Vec<String>> {
        let out = self
            .agent
            .run_command(&self.cfg.host, &format!("{} status", self.cfg.nodetool))?;
        let hosts = parse_live_hosts(&out);
        tracing::debug!(seed = %self.cfg.host, ?hosts, "live nodes");
        Ok(hosts)
    }

    fn capture_full(&self, host: &str, snapshot: &SnapshotId) -> Result<Capture> {
        let cmd = format!(
            "{} snapshot -t {} {}",
            self.cfg.nodetool,
            sh_quote(snapshot.as_str()),
            sh_quote(&self.cfg.keyspace)
        );
        self.agent.run_command(host, &cmd)?;
        self.collect(host, &format!("snapshots/{snapshot}"))
    }

    fn capture_incremental(&self, host: &str) -> Result<Capture> {
        let cmd = format!(
            "{} flush {}",
            self.cfg.nodetool,
            sh_quote(&self.cfg.keyspace)
        );
        self.agent.run_command(host, &cmd)?;
        self.collect(host, "backups")
    }

    fn bulk_load(&self, from_host: &str, target_node: &str, directory: &str) -> Result<()> {
        let cmd = format!(
            "{} --nodes {} -v {}",
            self.cfg.sstableloader,
            sh_quote(target_node),
            sh_quote(directory)
        );
        let out = self.agent.run_command(from_host, &cmd)?;
        tracing::debug!(
            from_host,
            target_node,
            directory,
            output = %sanitize_output(out.as_bytes()),
            "sstableloader finished"
        );
        Ok(())
    }
}
