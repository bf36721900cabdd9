use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use keyspace_backup::backup::{Backup, BackupOptions, BackupReport};
use keyspace_backup::cluster::CassandraCluster;
use keyspace_backup::collab::RemoteAgent;
use keyspace_backup::config::{self, BackupConfig, Overrides};
use keyspace_backup::history;
use keyspace_backup::logging::{self, LogFormat};
use keyspace_backup::remote::SshAgent;
use keyspace_backup::restore::{Restore, RestoreOptions, RestoreReport};
use keyspace_backup::snapshot::{KeyCodec, SnapshotId};
use keyspace_backup::store::open_store;
use keyspace_backup::{Error, Result};

#[derive(Debug, Parser)]
#[command(author, version, about = "Back up and restore a Cassandra keyspace through an object store")]
struct Args {
    /// Config file (default: $KSBACKUP_CONF, then ~/.ksbackup.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// More log output; repeat for more
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
    /// Hosts backed up concurrently (0 = use CPU count)
    #[arg(long, global = true)]
    max_parallel: Option<usize>,
    /// Any node of the cluster
    #[arg(long, global = true)]
    host: Option<String>,
    #[arg(long, global = true)]
    keyspace: Option<String>,
    /// Store prefix the keyspace's snapshots live under
    #[arg(long, global = true)]
    base_path: Option<String>,
    /// Root for restore staging directories
    #[arg(long, global = true)]
    temp_dir: Option<String>,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Snapshot every live node and upload the files
    Backup {
        /// Only ship files written since the latest snapshot
        #[arg(long)]
        incremental: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Download a snapshot chain and bulk-load it into the cluster
    Restore {
        /// Snapshot to restore (default: latest)
        #[arg(long)]
        snapshot: Option<String>,
        /// Resolve and print the plan without downloading anything
        #[arg(long)]
        dry_run: bool,
        /// Leave staged files in place afterwards
        #[arg(long)]
        keep_staging: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show stored snapshots, or the layers of one
    History {
        #[arg(long)]
        snapshot: Option<String>,
    },
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args = Args::parse();
    if let Err(e) = logging::init(args.verbose, args.log_format) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "ksbackup failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let overrides = Overrides {
        host: args.host.clone(),
        keyspace: args.keyspace.clone(),
        base_path: args.base_path.clone(),
        incremental: match &args.cmd {
            Command::Backup {
                incremental: true, ..
            } => Some(true),
            _ => None,
        },
        max_parallel: args.max_parallel,
        temp_dir: args.temp_dir.clone(),
    };
    let cfg = config::load(args.config.as_deref(), &overrides)?;

    match args.cmd {
        Command::Backup { json, .. } => cmd_backup(&cfg, json),
        Command::Restore {
            snapshot,
            dry_run,
            keep_staging,
            json,
        } => cmd_restore(&cfg, snapshot.as_deref(), dry_run, keep_staging, json),
        Command::History { snapshot } => cmd_history(&cfg, snapshot.as_deref()),
    }
}

fn parse_snapshot(raw: Option<&str>) -> Result<Option<SnapshotId>> {
    raw.map(SnapshotId::parse).transpose()
}

fn cmd_backup(cfg: &BackupConfig, json: bool) -> Result<()> {
    let agent: Arc<dyn RemoteAgent> = Arc::new(SshAgent::new(&cfg.ssh)?);
    let cluster = CassandraCluster::new(agent.clone(), &cfg.cluster);
    let store = open_store(&cfg.store)?;
    let codec = KeyCodec::new(cfg.scope()?);

    let opts = BackupOptions {
        incremental: cfg.run.incremental,
        max_parallel: cfg.max_parallel(),
        policy: cfg.run.host_failure_policy,
    };
    let report = Backup::new(&cluster, agent.as_ref(), store.as_ref(), codec).run(&opts)?;
    print_backup(&report, json)
}

fn print_backup(report: &BackupReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }
    println!(
        "snapshot {} ({}, parent {})",
        report.snapshot,
        if report.incremental { "incremental" } else { "full" },
        report.parent
    );
    for (host, n) in &report.files_per_host {
        println!("  {host}: {n} files");
    }
    for f in &report.failed {
        println!("  {}: FAILED: {}", f.host, f.reason);
    }
    Ok(())
}

fn cmd_restore(
    cfg: &BackupConfig,
    snapshot: Option<&str>,
    dry_run: bool,
    keep_staging: bool,
    json: bool,
) -> Result<()> {
    let agent: Arc<dyn RemoteAgent> = Arc::new(SshAgent::new(&cfg.ssh)?);
    let cluster = CassandraCluster::new(agent.clone(), &cfg.cluster);
    let store = open_store(&cfg.store)?;
    let codec = KeyCodec::new(cfg.scope()?);

    let opts = RestoreOptions {
        snapshot: parse_snapshot(snapshot)?,
        dry_run,
        keep_staging: keep_staging || cfg.run.keep_staging,
        staging_dir: cfg.staging_dir(),
        remote_dir: cfg.remote_staging_dir(),
    };
    let report = Restore::new(&cluster, agent.as_ref(), store.as_ref(), codec).run(&opts)?;
    print_restore(&report, json)
}

fn print_restore(report: &RestoreReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }
    println!(
        "{} {} ({} layers, {} files)",
        if report.dry_run { "would restore" } else { "restored" },
        report.target,
        report.layers.len(),
        report.key_count()
    );
    for layer in &report.layers {
        println!("  +-- {} ({} files)", layer.snapshot, layer.keys.len());
    }
    for dir in &report.directories {
        println!("  loaded {dir}");
    }
    Ok(())
}

fn cmd_history(cfg: &BackupConfig, snapshot: Option<&str>) -> Result<()> {
    let store = open_store(&cfg.store)?;
    let codec = KeyCodec::new(cfg.scope()?);
    let index = history::load_chain(store.as_ref(), &codec)?;
    let snapshot = parse_snapshot(snapshot)?;
    print!("{}", history::describe(&index, snapshot.as_ref())?);
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let s = serde_json::to_string_pretty(value)
        .map_err(|e| Error::msg(format!("failed to encode report: {e}")))?;
    println!("{s}");
    Ok(())
}
