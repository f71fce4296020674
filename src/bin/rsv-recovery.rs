use chrono::{DateTime, NaiveDateTime, Utc};
use clap::{Arg, ArgMatches, Command};
use rsvshop_recovery::cli::{self, Resolved};
use rsvshop_recovery::emergency::{EmergencyServer, WorkerCommand};
use rsvshop_recovery::logging::init_logging;
use rsvshop_recovery::store::seed;
use rsvshop_recovery::{BackupKind, Error, PassOutcome, RecoveryRuntime};
use std::sync::Arc;
use tracing::Level;

/// RSVShop data store recovery CLI
///
/// Snapshots, health checks, restores and the long-running backup/recovery
/// daemon. Exit code 0 on success, 1 on failure.

type CliResult = std::result::Result<(), Box<dyn std::error::Error>>;

fn main() {
    let matches = create_cli().get_matches();

    if let Err(e) = run_command(matches) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn create_cli() -> Command {
    Command::new("rsv-recovery")
        .about("RSVShop backup and recovery")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .args(cli::global_args())
        .subcommand(Command::new("check").about("Check data store connectivity and integrity"))
        .subcommand(Command::new("recover").about("Run one automatic recovery pass"))
        .subcommand(
            Command::new("restore")
                .about("Restore the data store from a snapshot")
                .arg(Arg::new("file")
                    .help("Snapshot filename or stem")
                    .required(true)
                    .index(1)),
        )
        .subcommand(
            Command::new("restore-time")
                .about("Restore the newest snapshot taken at or before a point in time")
                .arg(Arg::new("time")
                    .help("ISO 8601 timestamp, e.g. 2026-10-16T09:30:00Z")
                    .required(true)
                    .index(1)),
        )
        .subcommand(Command::new("seed").about("Replace the data store with the seed dataset"))
        .subcommand(Command::new("backup").about("Take a manual snapshot"))
        .subcommand(Command::new("list").about("List snapshots, newest first"))
        .subcommand(
            Command::new("delete")
                .about("Delete a snapshot and its metadata")
                .arg(Arg::new("file")
                    .help("Snapshot filename or stem")
                    .required(true)
                    .index(1)),
        )
        .subcommand(Command::new("start").about("Run the backup scheduler and health watch"))
        .subcommand(
            Command::new("serve")
                .about("Run the emergency recovery HTTP service")
                .arg(Arg::new("port")
                    .help("Port to listen on")
                    .short('p')
                    .long("port")),
        )
}

fn run_command(matches: ArgMatches) -> CliResult {
    let resolved = Resolved::from_matches(&matches)?;
    init_logging(Level::INFO, resolved.json_logs);

    if let Some(("serve", sub)) = matches.subcommand() {
        return cmd_serve(resolved, sub);
    }

    let runtime = RecoveryRuntime::open(resolved.config)?;
    match matches.subcommand() {
        Some(("check", _)) => cmd_check(&runtime),
        Some(("recover", _)) => cmd_recover(&runtime),
        Some(("restore", sub)) => cmd_restore(&runtime, required(sub, "file")?),
        Some(("restore-time", sub)) => cmd_restore_time(&runtime, required(sub, "time")?),
        Some(("seed", _)) => cmd_seed(&runtime),
        Some(("backup", _)) => cmd_backup(&runtime),
        Some(("list", _)) => cmd_list(&runtime),
        Some(("delete", sub)) => cmd_delete(&runtime, required(sub, "file")?),
        Some(("start", _)) => cmd_start(runtime),
        _ => unreachable!("subcommand_required"),
    }
}

fn required<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a str, Error> {
    matches
        .get_one::<String>(name)
        .map(String::as_str)
        .ok_or_else(|| Error::Config(format!("missing argument <{}>", name)))
}

fn cmd_check(runtime: &RecoveryRuntime) -> CliResult {
    let report = runtime.monitor.report();
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.verdict.store_reachable {
        return Err(Error::Connectivity(report.problems.join("; ")).into());
    }
    if !report.verdict.integrity_ok {
        return Err(Error::Integrity(report.problems.join("; ")).into());
    }
    Ok(())
}

fn cmd_recover(runtime: &RecoveryRuntime) -> CliResult {
    let orchestrator = runtime.orchestrator();
    let outcome = orchestrator.recover_once();

    for attempt in orchestrator.attempts() {
        println!(
            "{} {:?} {}: {}",
            attempt.started_at.format("%Y-%m-%d %H:%M:%S"),
            attempt.outcome,
            attempt.strategy.as_str(),
            attempt.detail
        );
    }

    match outcome {
        PassOutcome::AlreadyHealthy => {
            println!("Data store is healthy, nothing to recover");
            Ok(())
        }
        PassOutcome::Recovered => {
            println!("Data store recovered");
            Ok(())
        }
        PassOutcome::Deferred => Err(Error::Restore(
            "another recovery operation is in progress".into(),
        )
        .into()),
        PassOutcome::Failed | PassOutcome::Ignored => Err(Error::Integrity(
            "automatic recovery failed, operator intervention required".into(),
        )
        .into()),
    }
}

fn cmd_restore(runtime: &RecoveryRuntime, file: &str) -> CliResult {
    runtime.audit.info(&format!("Manual restore requested: {}", file));
    match runtime.restore.restore_named(file) {
        Ok(report) => {
            runtime.audit.info(&format!(
                "Restored {} records from {}",
                report.loaded.values().sum::<usize>(),
                report.source
            ));
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(e) => {
            runtime.audit.error(&format!("Manual restore of {} failed: {}", file, e));
            Err(e.into())
        }
    }
}

fn cmd_restore_time(runtime: &RecoveryRuntime, time: &str) -> CliResult {
    let target = parse_time(time)?;
    runtime
        .audit
        .info(&format!("Point-in-time restore requested: {}", target.to_rfc3339()));
    match runtime.restore.restore_as_of(target) {
        Ok(snapshot) => {
            let source = snapshot
                .path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            runtime.audit.info(&format!("Restored {}", source));
            println!(
                "Restored snapshot taken {} ({})",
                snapshot.created_at.to_rfc3339(),
                source
            );
            Ok(())
        }
        Err(e) => {
            runtime.audit.error(&format!("Point-in-time restore failed: {}", e));
            Err(e.into())
        }
    }
}

fn parse_time(input: &str) -> Result<DateTime<Utc>, Error> {
    if let Ok(t) = DateTime::parse_from_rfc3339(input) {
        return Ok(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(input, "%Y-%m-%dT%H:%M:%S")
        .map(|t| t.and_utc())
        .map_err(|e| Error::Config(format!("invalid time '{}': {}", input, e)))
}

fn cmd_seed(runtime: &RecoveryRuntime) -> CliResult {
    let snapshot = seed::load(runtime.config.recovery.seed_file.as_deref())?;
    runtime.audit.info("Manual reseed requested");
    let report = runtime.restore.restore(&snapshot)?;
    runtime.audit.info(&format!(
        "Seeded {} records",
        report.loaded.values().sum::<usize>()
    ));
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn cmd_backup(runtime: &RecoveryRuntime) -> CliResult {
    let snapshot = runtime.scheduler().create_snapshot(BackupKind::Manual)?;
    let path = snapshot
        .path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    runtime.audit.info(&format!("Manual backup written: {}", path));
    println!("Backup created: {} ({} bytes)", path, snapshot.size);
    Ok(())
}

fn cmd_list(runtime: &RecoveryRuntime) -> CliResult {
    let backups = runtime.snapshots.list()?;
    if backups.is_empty() {
        println!("No snapshots in {}", runtime.snapshots.dir().display());
        return Ok(());
    }

    println!("{:<40} {:<25} {:>12} {:<10}", "FILE", "CREATED", "SIZE", "TYPE");
    for backup in &backups {
        println!(
            "{:<40} {:<25} {:>12} {:<10}",
            backup.filename,
            backup.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            backup.size,
            backup.kind.as_str()
        );
    }
    println!(
        "{} snapshots, {} bytes total",
        backups.len(),
        backups.iter().map(|b| b.size).sum::<u64>()
    );
    Ok(())
}

fn cmd_delete(runtime: &RecoveryRuntime, file: &str) -> CliResult {
    if !runtime.snapshots.delete(file)? {
        return Err(Error::SnapshotNotFound(file.to_string()).into());
    }
    runtime.audit.info(&format!("Snapshot deleted: {}", file));
    println!("Deleted {}", file);
    Ok(())
}

fn cmd_start(runtime: RecoveryRuntime) -> CliResult {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        runtime.audit.info("Backup scheduler and health watch starting");
        let scheduler = Arc::new(runtime.scheduler());
        let orchestrator = Arc::new(runtime.orchestrator());

        let backups = scheduler.clone().start();
        let watch = orchestrator
            .clone()
            .watch(runtime.config.health_interval());

        tokio::signal::ctrl_c().await?;
        runtime.audit.info("Shutdown requested");
        scheduler.stop();
        orchestrator.stop();
        let _ = backups.await;
        let _ = watch.await;
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

fn cmd_serve(resolved: Resolved, matches: &ArgMatches) -> CliResult {
    let mut config = resolved.config.clone();
    if let Some(port) = matches.get_one::<String>("port") {
        config.emergency.port = port
            .parse()
            .map_err(|_| Error::Config(format!("invalid port '{}'", port)))?;
    }

    let worker = WorkerCommand::new(std::env::current_exe()?, resolved.worker_args());
    let addr = format!("{}:{}", config.emergency.host, config.emergency.port);
    let runtime = RecoveryRuntime::open(config)?;
    let server = EmergencyServer::bind(&addr, runtime.emergency_context(worker))?;
    println!("Emergency recovery service on http://{}", server.local_addr()?);
    server.serve()?;
    Ok(())
}
