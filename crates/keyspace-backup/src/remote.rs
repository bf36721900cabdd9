//! `RemoteAgent` over the system `ssh`/`scp` binaries.
//!
//! Each host gets one OpenSSH control master, created lazily by the first
//! command and shared by every later one. Commands against a host are
//! serialised by a lease; a streaming `read_file` holds it until the
//! returned reader is dropped.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Condvar, Mutex};

use crate::collab::{ByteStream, EntryKind, RemoteAgent};
use crate::config::{SshConfig, resolve_string_field};
use crate::error::{Error, Result};
use crate::log_sanitize::sanitize_output;
use crate::process::{ChildReader, run_command_capture, run_command_output, sh_quote};

/// Directories shallower than this are never removed.
const MIN_REMOVABLE_DEPTH: usize = 3;
const CONTROL_PERSIST_SECS: u64 = 60;

#[derive(Debug, Clone)]
struct SshResolved {
    user: Option<String>,
    identity_file: Option<String>,
    port: Option<u16>,
    known_hosts_file: Option<String>,
    strict_host_key_checking: Option<bool>,
    connect_timeout_secs: u64,
}

impl SshResolved {
    fn from_config(cfg: &SshConfig) -> Self {
        Self {
            user: resolve_string_field(cfg.user.as_deref(), cfg.user_env.as_deref()),
            identity_file: resolve_string_field(
                cfg.identity_file.as_deref(),
                cfg.identity_file_env.as_deref(),
            ),
            port: cfg.port,
            known_hosts_file: cfg
                .known_hosts_file
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned),
            strict_host_key_checking: cfg.strict_host_key_checking,
            connect_timeout_secs: cfg.connect_timeout_secs,
        }
    }

    fn target(&self, host: &str) -> String {
        match self.user.as_deref() {
            Some(u) => format!("{u}@{host}"),
            None => host.to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct HostSession {
    busy: Mutex<bool>,
    idle: Condvar,
}

/// Exclusive use of one host's session until dropped.
struct Lease {
    session: Arc<HostSession>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut busy = self
            .session
            .busy
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *busy = false;
        self.session.idle.notify_one();
    }
}

/// Control-master sessions keyed by host.
pub struct SessionPool {
    control_dir: PathBuf,
    owns_control_dir: bool,
    sessions: Mutex<BTreeMap<String, Arc<HostSession>>>,
}

impl SessionPool {
    fn new(control_dir: Option<&str>) -> Result<Self> {
        let (control_dir, owns_control_dir) = match control_dir.map(str::trim) {
            Some(dir) if !dir.is_empty() => (PathBuf::from(dir), false),
            _ => (
                std::env::temp_dir().join(format!("ksbackup-ssh-{}", std::process::id())),
                true,
            ),
        };
        fs::create_dir_all(&control_dir).map_err(|e| {
            Error::msg(format!(
                "failed to create ssh control dir {}: {e}",
                control_dir.display()
            ))
        })?;
        Ok(Self {
            control_dir,
            owns_control_dir,
            sessions: Mutex::new(BTreeMap::new()),
        })
    }

    fn control_path(&self) -> String {
        // %C is a hash of the connection tuple, which keeps socket paths short.
        format!("{}/%C", self.control_dir.display())
    }

    fn lease(&self, host: &str) -> Lease {
        let session = {
            let mut sessions = self
                .sessions
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            sessions.entry(host.to_string()).or_default().clone()
        };
        {
            let mut busy = session
                .busy
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            while *busy {
                busy = session
                    .idle
                    .wait(busy)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
            *busy = true;
        }
        Lease { session }
    }

    fn hosts(&self) -> Vec<String> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

pub struct SshAgent {
    ssh: SshResolved,
    pool: SessionPool,
}

impl SshAgent {
    pub fn new(cfg: &SshConfig) -> Result<Self> {
        Ok(Self {
            ssh: SshResolved::from_config(cfg),
            pool: SessionPool::new(cfg.control_dir.as_deref())?,
        })
    }

    fn configure(&self, cmd: &mut Command, scp_style: bool) {
        if let Some(port) = self.ssh.port {
            cmd.arg(if scp_style { "-P" } else { "-p" })
                .arg(port.to_string());
        }
        if let Some(id) = self
            .ssh
            .identity_file
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            cmd.arg("-i").arg(id);
        }
        if let Some(kh) = self.ssh.known_hosts_file.as_deref() {
            cmd.arg("-o").arg(format!("UserKnownHostsFile={kh}"));
        }
        if matches!(self.ssh.strict_host_key_checking, Some(false)) {
            cmd.arg("-o").arg("StrictHostKeyChecking=no");
            if self.ssh.known_hosts_file.is_none() {
                cmd.arg("-o").arg("UserKnownHostsFile=/dev/null");
            }
        }
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.ssh.connect_timeout_secs))
            .arg("-o")
            .arg("ControlMaster=auto")
            .arg("-o")
            .arg(format!("ControlPath={}", self.pool.control_path()))
            .arg("-o")
            .arg(format!("ControlPersist={CONTROL_PERSIST_SECS}"));
    }

    fn ssh_cmd(&self, host: &str, remote_cmd: &str) -> Command {
        let mut cmd = Command::new("ssh");
        self.configure(&mut cmd, false);
        cmd.arg(self.ssh.target(host)).arg(remote_cmd);
        cmd
    }

    fn run(&self, host: &str, remote_cmd: &str) -> Result<String> {
        let _lease = self.pool.lease(host);
        tracing::debug!(host, cmd = remote_cmd, "ssh");
        let mut cmd = self.ssh_cmd(host, remote_cmd);
        let out = run_command_output(&mut cmd)?;
        if out.status.success() {
            return Ok(String::from_utf8_lossy(&out.stdout).into_owned());
        }
        let detail = sanitize_output(&out.stderr);
        Err(Error::msg(format!(
            "ssh {host}: `{}` exited with {}: {}",
            sanitize_output(remote_cmd.as_bytes()),
            out.status,
            if detail.is_empty() {
                "no output"
            } else {
                detail.as_str()
            }
        )))
    }
}

/// Build the `find` invocation listing direct children of `dir`.
pub(crate) fn list_entries_command(dir: &str, kind: EntryKind) -> String {
    let q = sh_quote(dir);
    format!(
        "if [ -d {q} ]; then find {q} -mindepth 1 -maxdepth 1 -type {}; fi",
        kind.find_type()
    )
}

/// Refuse to `rm -rf` anything relative, traversing, or close to `/`.
pub(crate) fn check_removable(dir: &str) -> Result<()> {
    let path = Path::new(dir);
    if !path.is_absolute() {
        return Err(Error::msg(format!("refusing to remove relative path '{dir}'")));
    }
    let mut depth = 0usize;
    for c in path.components() {
        match c {
            Component::Normal(_) => depth += 1,
            Component::RootDir => {}
            _ => {
                return Err(Error::msg(format!(
                    "refusing to remove non-normalised path '{dir}'"
                )));
            }
        }
    }
    if depth < MIN_REMOVABLE_DEPTH {
        return Err(Error::msg(format!("refusing to remove shallow path '{dir}'")));
    }
    Ok(())
}

impl RemoteAgent for SshAgent {
    fn run_command(&self, host: &str, cmd: &str) -> Result<String> {
        self.run(host, cmd)
    }

    fn list_entries(&self, host: &str, dir: &str, kind: EntryKind) -> Result<Vec<String>> {
        let out = self.run(host, &list_entries_command(dir, kind))?;
        let mut entries = out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToOwned::to_owned)
            .collect::<Vec<_>>();
        entries.sort();
        Ok(entries)
    }

    fn read_file(&self, host: &str, path: &str) -> Result<ByteStream> {
        let lease = self.pool.lease(host);
        tracing::debug!(host, path, "streaming remote file");
        let cmd = self.ssh_cmd(host, &format!("cat -- {}", sh_quote(path)));
        let reader = ChildReader::spawn(cmd, format!("read {path} @ {host}"))?.with_guard(lease);
        Ok(Box::new(reader))
    }

    fn transfer_file(&self, host: &str, local_path: &Path, remote_dir: &str) -> Result<()> {
        self.run(host, &format!("mkdir -p -- {}", sh_quote(remote_dir)))?;

        let _lease = self.pool.lease(host);
        tracing::debug!(host, local = %local_path.display(), remote_dir, "scp");
        let mut cmd = Command::new("scp");
        self.configure(&mut cmd, true);
        cmd.arg("-q").arg(local_path).arg(format!(
            "{}:{}/",
            self.ssh.target(host),
            remote_dir.trim_end_matches('/')
        ));
        run_command_capture(cmd)
            .map(|_| ())
            .map_err(|e| Error::msg(format!("scp {} -> {host}: {e}", local_path.display())))
    }

    fn remove_dirs(&self, host: &str, dirs: &[String]) -> Result<()> {
        if dirs.is_empty() {
            return Ok(());
        }
        for d in dirs {
            check_removable(d)?;
        }
        let args = dirs.iter().map(|d| sh_quote(d)).collect::<Vec<_>>().join(" ");
        self.run(host, &format!("rm -rf -- {args}")).map(|_| ())
    }
}

impl Drop for SshAgent {
    fn drop(&mut self) {
        for host in self.pool.hosts() {
            let mut cmd = Command::new("ssh");
            cmd.arg("-o")
                .arg(format!("ControlPath={}", self.pool.control_path()))
                .arg("-O")
                .arg("exit");
            if let Some(port) = self.ssh.port {
                cmd.arg("-p").arg(port.to_string());
            }
            cmd.arg(self.ssh.target(&host));
            let _ = run_command_output(&mut cmd);
        }
        if self.pool.owns_control_dir {
            let _ = fs::remove_dir_all(&self.pool.control_dir);
        }
    }
}
