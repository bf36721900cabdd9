use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use toml::Value;

use crate::error::{Error, Result};
use crate::snapshot::Scope;

pub const CONFIG_ENV: &str = "KSBACKUP_CONF";
const DEFAULT_CONFIG_FILE: &str = ".ksbackup.toml";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BackupConfig {
    pub cluster: ClusterConfig,
    pub ssh: SshConfig,
    pub store: StoreConfig,
    pub run: RunConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Any one node; used for topology discovery.
    pub host: String,
    pub keyspace: String,
    pub nodetool: String,
    pub sstableloader: String,
    pub cassandra_conf: String,
    /// Overrides `data_file_directories` from the node's cassandra.yaml.
    pub data_dirs: Vec<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            keyspace: String::new(),
            nodetool: "/usr/bin/nodetool".into(),
            sstableloader: "/usr/bin/sstableloader".into(),
            cassandra_conf: "/etc/cassandra".into(),
            data_dirs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SshConfig {
    pub user: Option<String>,
    pub user_env: Option<String>,
    pub identity_file: Option<String>,
    pub identity_file_env: Option<String>,
    pub port: Option<u16>,
    pub known_hosts_file: Option<String>,
    pub strict_host_key_checking: Option<bool>,
    pub connect_timeout_secs: u64,
    /// Where control-master sockets live; a private temp dir when unset.
    pub control_dir: Option<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: None,
            user_env: Some("USER".into()),
            identity_file: None,
            identity_file_env: None,
            port: None,
            known_hosts_file: None,
            strict_host_key_checking: None,
            connect_timeout_secs: 10,
            control_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    S3,
    Http,
    Local,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    pub base_path: String,
    pub s3: S3StoreConfig,
    pub http: HttpStoreConfig,
    pub local: LocalStoreConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::S3,
            base_path: "cassandra-backups".into(),
            s3: S3StoreConfig::default(),
            http: HttpStoreConfig::default(),
            local: LocalStoreConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct S3StoreConfig {
    pub bucket: String,
    pub bucket_env: Option<String>,
    pub region: Option<String>,
    pub region_env: Option<String>,
    pub endpoint_url: Option<String>,
    pub endpoint_url_env: Option<String>,
    pub profile: Option<String>,
    pub profile_env: Option<String>,
    pub aws_access_key_id_env: Option<String>,
    pub aws_secret_access_key_env: Option<String>,
    pub aws_session_token_env: Option<String>,
    pub page_size: u32,
}

impl Default for S3StoreConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            bucket_env: None,
            region: Some("us-east-1".into()),
            region_env: None,
            endpoint_url: None,
            endpoint_url_env: None,
            profile: None,
            profile_env: None,
            aws_access_key_id_env: None,
            aws_secret_access_key_env: None,
            aws_session_token_env: None,
            page_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpStoreConfig {
    pub base_url: String,
    pub base_url_env: Option<String>,
    pub token: Option<String>,
    pub token_env: Option<String>,
    pub timeout_secs: u64,
}

impl Default for HttpStoreConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            base_url_env: None,
            token: None,
            token_env: None,
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LocalStoreConfig {
    pub root: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum HostFailurePolicy {
    /// Stop starting hosts after the first failure and return it.
    #[default]
    Abort,
    /// Log failures, keep going, list failed hosts in the report.
    BestEffort,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RunConfig {
    pub incremental: bool,
    /// Hosts backed up concurrently (0 = CPU count).
    pub max_parallel: usize,
    pub host_failure_policy: HostFailurePolicy,
    /// Root for restore staging; `local/` and `remote/` live beneath it.
    pub temp_dir: String,
    pub keep_staging: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            incremental: false,
            max_parallel: 0,
            host_failure_policy: HostFailurePolicy::Abort,
            temp_dir: "/tmp/keyspace-backup".into(),
            keep_staging: false,
        }
    }
}

/// Command-line values that win over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub keyspace: Option<String>,
    pub base_path: Option<String>,
    pub incremental: Option<bool>,
    pub max_parallel: Option<usize>,
    pub temp_dir: Option<String>,
}

impl BackupConfig {
    pub fn apply(&mut self, o: &Overrides) {
        if let Some(v) = non_empty(o.host.as_deref()) {
            self.cluster.host = v;
        }
        if let Some(v) = non_empty(o.keyspace.as_deref()) {
            self.cluster.keyspace = v;
        }
        if let Some(v) = non_empty(o.base_path.as_deref()) {
            self.store.base_path = v;
        }
        if let Some(v) = non_empty(o.temp_dir.as_deref()) {
            self.run.temp_dir = v;
        }
        if let Some(v) = o.incremental {
            self.run.incremental = v;
        }
        if let Some(v) = o.max_parallel {
            self.run.max_parallel = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("cluster.host", self.cluster.host.as_str()),
            ("cluster.keyspace", self.cluster.keyspace.as_str()),
            ("cluster.nodetool", self.cluster.nodetool.as_str()),
            ("cluster.sstableloader", self.cluster.sstableloader.as_str()),
            ("cluster.cassandra_conf", self.cluster.cassandra_conf.as_str()),
            ("store.base_path", self.store.base_path.as_str()),
            ("run.temp_dir", self.run.temp_dir.as_str()),
        ];
        for (path, v) in required {
            if v.trim().is_empty() {
                return Err(Error::config(format!("{path} is empty")));
            }
        }
        match self.store.kind {
            StoreKind::S3 => {
                resolve_required_string_field(
                    "store.s3.bucket",
                    Some(self.store.s3.bucket.as_str()),
                    self.store.s3.bucket_env.as_deref(),
                )?;
            }
            StoreKind::Http => {
                resolve_required_string_field(
                    "store.http.base_url",
                    Some(self.store.http.base_url.as_str()),
                    self.store.http.base_url_env.as_deref(),
                )?;
            }
            StoreKind::Local => {
                if self.store.local.root.trim().is_empty() {
                    return Err(Error::config("store.local.root is empty"));
                }
            }
        }
        self.scope().map(|_| ())
    }

    pub fn scope(&self) -> Result<Scope> {
        Scope::new(&self.store.base_path, &self.cluster.keyspace)
    }

    pub fn max_parallel(&self) -> usize {
        if self.run.max_parallel == 0 {
            num_cpus::get().max(1)
        } else {
            self.run.max_parallel
        }
    }

    pub fn staging_dir(&self) -> PathBuf {
        PathBuf::from(&self.run.temp_dir).join("local")
    }

    pub fn remote_staging_dir(&self) -> String {
        format!("{}/remote", self.run.temp_dir.trim_end_matches('/'))
    }
}

fn non_empty(v: Option<&str>) -> Option<String> {
    v.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
}

pub(crate) fn resolve_env_ref(env_key: Option<&str>) -> Option<String> {
    env_key
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|k| std::env::var(k).ok())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub(crate) fn resolve_string_field(literal: Option<&str>, env_key: Option<&str>) -> Option<String> {
    non_empty(literal).or_else(|| resolve_env_ref(env_key))
}

pub(crate) fn resolve_required_string_field(
    cfg_path: &str,
    literal: Option<&str>,
    env_key: Option<&str>,
) -> Result<String> {
    resolve_string_field(literal, env_key).ok_or_else(|| {
        if let Some(k) = env_key.map(str::trim).filter(|s| !s.is_empty()) {
            Error::config(format!("{cfg_path} is empty (also checked env var '{k}')"))
        } else {
            Error::config(format!("{cfg_path} is empty"))
        }
    })
}

/// Which file to read: explicit path, then `$KSBACKUP_CONF`, then
/// `~/.ksbackup.toml`. Only an explicit path has to exist.
pub fn config_path(explicit: Option<&Path>) -> Option<(PathBuf, bool)> {
    if let Some(p) = explicit {
        return Some((p.to_path_buf(), true));
    }
    if let Some(p) = resolve_env_ref(Some(CONFIG_ENV)) {
        return Some((PathBuf::from(p), true));
    }
    resolve_env_ref(Some("HOME")).map(|home| (Path::new(&home).join(DEFAULT_CONFIG_FILE), false))
}

/// Defaults, then the config file (with `extends`), then `overrides`.
pub fn load(explicit: Option<&Path>, overrides: &Overrides) -> Result<BackupConfig> {
    let mut cfg = match config_path(explicit) {
        Some((path, required)) if required || path.is_file() => {
            tracing::debug!(path = %path.display(), "reading config file");
            parse_file(&path)?
        }
        _ => BackupConfig::default(),
    };
    cfg.apply(overrides);
    cfg.validate()?;
    Ok(cfg)
}

pub fn parse_file(path: &Path) -> Result<BackupConfig> {
    let mut stack = HashSet::<PathBuf>::new();
    let value = load_value_inner(path, &mut stack)?;
    value
        .try_into()
        .map_err(|e| Error::config(format!("invalid config {}: {e}", path.display())))
}

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (base_slot, child_val) => {
            *base_slot = child_val;
        }
    }
}

fn load_value_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::config(format!(
            "config extends cycle at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;

    let mut out = Value::Table(Default::default());
    if let Some(ext) = value.get("extends").and_then(Value::as_str) {
        let base = PathBuf::from(ext);
        let base = if base.is_absolute() {
            base
        } else {
            path.parent().unwrap_or_else(|| Path::new(".")).join(base)
        };
        out = load_value_inner(&base, stack)?;
    }
    if let Some(tbl) = value.as_table_mut() {
        tbl.remove("extends");
    }
    merge_values(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}
