//! Take a full or incremental snapshot on every live node and push the
//! files to the object store.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::collab::{ClusterControl, ObjectStore, RemoteAgent};
use crate::compress::gzip_stream;
use crate::config::HostFailurePolicy;
use crate::error::{Error, Result};
use crate::history::load_chain;
use crate::snapshot::{KeyCodec, SnapshotId};

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub incremental: bool,
    pub max_parallel: usize,
    pub policy: HostFailurePolicy,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            incremental: false,
            max_parallel: 1,
            policy: HostFailurePolicy::Abort,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostFailure {
    pub host: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub snapshot: SnapshotId,
    pub parent: SnapshotId,
    /// False when an incremental run was downgraded to a full one.
    pub incremental: bool,
    /// Files stored per host that completed.
    pub files_per_host: BTreeMap<String, usize>,
    pub failed: Vec<HostFailure>,
}

impl BackupReport {
    pub fn total_files(&self) -> usize {
        self.files_per_host.values().sum()
    }
}

#[derive(Debug, Clone)]
struct RunPlan {
    snapshot: SnapshotId,
    parent: SnapshotId,
    incremental: bool,
}

type Clock<'a> = Box<dyn Fn() -> DateTime<Utc> + Send + Sync + 'a>;

pub struct Backup<'a> {
    cluster: &'a dyn ClusterControl,
    agent: &'a dyn RemoteAgent,
    store: &'a dyn ObjectStore,
    codec: KeyCodec,
    clock: Clock<'a>,
}

impl<'a> Backup<'a> {
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
            clock: Box::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'a) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn run(&self, opts: &BackupOptions) -> Result<BackupReport> {
        let hosts = self.cluster.list_live_hosts()?;
        if hosts.is_empty() {
            return Err(Error::NoHostsFound);
        }

        let index = load_chain(self.store, &self.codec)?;
        let latest = index.latest();

        let snapshot = SnapshotId::generate((self.clock)());
        if let Some(latest) = latest.as_ref() {
            if !snapshot.is_after(latest) {
                return Err(Error::NonMonotonicTimestamp {
                    generated: snapshot.to_string(),
                    latest: latest.to_string(),
                });
            }
        }

        let plan = match (opts.incremental, latest) {
            (true, Some(parent)) => RunPlan {
                snapshot,
                parent,
                incremental: true,
            },
            (requested, _) => {
                if requested {
                    tracing::warn!("no previous snapshot to build on; taking a full snapshot");
                }
                RunPlan {
                    parent: snapshot.clone(),
                    snapshot,
                    incremental: false,
                }
            }
        };
        tracing::info!(
            snapshot = %plan.snapshot,
            parent = %plan.parent,
            incremental = plan.incremental,
            hosts = hosts.len(),
            "starting backup"
        );

        let (files_per_host, failed) = self.run_hosts(&hosts, &plan, opts)?;

        let report = BackupReport {
            snapshot: plan.snapshot,
            parent: plan.parent,
            incremental: plan.incremental,
            files_per_host,
            failed,
        };
        if report.total_files() == 0 {
            tracing::warn!(
                snapshot = %report.snapshot,
                "no files were captured; this snapshot will not appear in the store listing"
            );
        }
        tracing::info!(
            snapshot = %report.snapshot,
            files = report.total_files(),
            failed_hosts = report.failed.len(),
            "backup finished"
        );
        Ok(report)
    }

    /// Per-host workers, at most `max_parallel` at once. Under `Abort`, no
    /// host is started after the first failure; running ones finish. An
    /// abort after any file was stored is reported as a partial snapshot.
    fn run_hosts(
        &self,
        hosts: &[String],
        plan: &RunPlan,
        opts: &BackupOptions,
    ) -> Result<(BTreeMap<String, usize>, Vec<HostFailure>)> {
        let max_parallel = opts.max_parallel.max(1);
        let mut done = BTreeMap::<String, usize>::new();
        let mut failed = Vec::<HostFailure>::new();
        let mut first_err: Option<Error> = None;
        let stored = AtomicUsize::new(0);
        let stored_ref = &stored;

        thread::scope(|s| -> Result<()> {
            let (tx, rx) = mpsc::channel::<(String, Result<usize>)>();
            let mut pending = hosts.iter();
            let mut running = 0usize;

            loop {
                while first_err.is_none() && running < max_parallel {
                    let Some(host) = pending.next() else {
                        break;
                    };
                    let tx = tx.clone();
                    s.spawn(move || {
                        let res = panic::catch_unwind(AssertUnwindSafe(|| {
                            self.backup_host(host, plan, stored_ref)
                        }))
                        .unwrap_or_else(|_| {
                            Err(Error::msg(format!("backup worker for {host} panicked")))
                        });
                        let _ = tx.send((host.clone(), res));
                    });
                    running += 1;
                }
                if running == 0 {
                    break;
                }

                let (host, res) = rx
                    .recv()
                    .map_err(|e| Error::msg(format!("backup worker channel closed: {e}")))?;
                running -= 1;
                match res {
                    Ok(n) => {
                        tracing::info!(%host, files = n, "host done");
                        done.insert(host, n);
                    }
                    Err(e) => {
                        tracing::error!(%host, error = %e, "host failed");
                        failed.push(HostFailure {
                            host,
                            reason: e.to_string(),
                        });
                        let stop = match opts.policy {
                            HostFailurePolicy::Abort => true,
                            HostFailurePolicy::BestEffort => failed.len() == hosts.len(),
                        };
                        if stop && first_err.is_none() {
                            first_err = Some(e);
                        }
                    }
                }
            }
            Ok(())
        })?;

        if let Some(e) = first_err {
            let stored = stored.load(Ordering::SeqCst);
            if stored == 0 {
                return Err(e);
            }
            tracing::warn!(
                snapshot = %plan.snapshot,
                stored,
                "backup stopped with files already stored; snapshot is partial"
            );
            return Err(Error::PartialSnapshot {
                snapshot: plan.snapshot.to_string(),
                stored,
                source: Box::new(e),
            });
        }
        Ok((done, failed))
    }

    fn backup_host(&self, host: &str, plan: &RunPlan, stored: &AtomicUsize) -> Result<usize> {
        let capture = if plan.incremental {
            self.cluster.capture_incremental(host)
        } else {
            self.cluster.capture_full(host, &plan.snapshot)
        }
        .map_err(|e| Error::capture_failed(host, e))?;
        tracing::debug!(host, files = capture.files.len(), "captured");

        for file in &capture.files {
            let key = self
                .codec
                .encode(&plan.parent, &plan.snapshot, host, file, plan.incremental)
                .map_err(|e| Error::upload_failed(host, file, e))?;
            let reader = self
                .agent
                .read_file(host, file)
                .map_err(|e| Error::upload_failed(host, file, e))?;
            self.store
                .put_object(&key, Box::new(gzip_stream(reader)))
                .map_err(|e| Error::upload_failed(host, file, e))?;
            stored.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(host, %key, "stored");
        }

        self.agent
            .remove_dirs(host, &capture.dirs)
            .map_err(|e| Error::cleanup_failed(host, e))?;
        Ok(capture.files.len())
    }
}
