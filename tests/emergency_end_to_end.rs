//! Drives the real `rsv-recovery` binary through the emergency HTTP service.

mod common;

use common::populate;
use rsvshop_recovery::emergency::{EmergencyServer, ServiceContext, WorkerCommand};
use rsvshop_recovery::logging::AuditLog;
use rsvshop_recovery::recovery::SystemProcessController;
use rsvshop_recovery::snapshot::SnapshotStore;
use rsvshop_recovery::{BackupKind, BackupScheduler, Collection, DataStore, FileStore, RecoveryGuard};
use serde_json::Value;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::process::{Command, Output};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const BIN: &str = env!("CARGO_BIN_EXE_rsv-recovery");

fn global_args(root: &Path) -> Vec<String> {
    vec![
        "--data-dir".into(),
        root.join("data").display().to_string(),
        "--backup-dir".into(),
        root.join("backups").display().to_string(),
        "--log-dir".into(),
        root.join("logs").display().to_string(),
    ]
}

fn run_cli(root: &Path, args: &[&str]) -> Output {
    Command::new(BIN)
        .args(global_args(root))
        .args(args)
        .env_remove("RSV_DATA_DIR")
        .env_remove("RSV_BACKUP_DIR")
        .env_remove("RSV_LOG_DIR")
        .output()
        .unwrap()
}

fn post(addr: SocketAddr, path: &str, body: &str) -> (u16, Value) {
    let mut stream = TcpStream::connect(addr).unwrap();
    write!(
        stream,
        "POST {} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        path,
        body.len(),
        body
    )
    .unwrap();

    let mut reader = BufReader::new(stream);
    let mut status_line = String::new();
    reader.read_line(&mut status_line).unwrap();
    let status = status_line.split_whitespace().nth(1).unwrap().parse().unwrap();

    let mut content_length = 0;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        if line.trim().is_empty() {
            break;
        }
        if let Some(value) = line.strip_prefix("Content-Length:") {
            content_length = value.trim().parse().unwrap();
        }
    }
    let mut body = vec![0; content_length];
    reader.read_exact(&mut body).unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

fn start_server(root: &Path) -> SocketAddr {
    let ctx = ServiceContext::new(
        SnapshotStore::open(root.join("backups")).unwrap(),
        Arc::new(SystemProcessController::default()),
        WorkerCommand::new(BIN, global_args(root)),
        Arc::new(AuditLog::open(root.join("logs").join("db-recovery.log")).unwrap()),
        Duration::from_secs(60),
    );
    let server = EmergencyServer::bind("127.0.0.1:0", ctx).unwrap();
    let addr = server.local_addr().unwrap();
    server.spawn();
    addr
}

/// Take `backup-2` of a healthy store, then wreck the store.
fn prepare(root: &Path) {
    let store = Arc::new(FileStore::open(root.join("data")).unwrap());
    populate(store.as_ref());
    let scheduler = BackupScheduler::new(
        store.clone(),
        SnapshotStore::open(root.join("backups")).unwrap(),
        RecoveryGuard::new(),
        Duration::from_secs(3600),
    );
    scheduler
        .create_snapshot_named("backup-2", BackupKind::Manual)
        .unwrap();

    store.delete_all(Collection::Hotels).unwrap();
    store.delete_all(Collection::Users).unwrap();
    std::fs::write(root.join("data").join("rooms.json"), b"corrupted").unwrap();
}

#[test]
fn test_emergency_restore_repairs_corrupted_store() {
    let dir = TempDir::new().unwrap();
    prepare(dir.path());

    let check = run_cli(dir.path(), &["check"]);
    assert!(!check.status.success());

    let addr = start_server(dir.path());
    let (status, body) = post(addr, "/restore", r#"{"filename":"backup-2"}"#);
    assert_eq!(status, 200, "{}", body);
    assert_eq!(body["success"], true);

    let check = run_cli(dir.path(), &["check"]);
    let stdout = String::from_utf8_lossy(&check.stdout);
    assert!(check.status.success(), "{}", String::from_utf8_lossy(&check.stderr));
    let report: Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["verdict"]["storeReachable"], true);
    assert_eq!(report["verdict"]["integrityOk"], true);
    assert_eq!(report["counts"]["hotels"], 1);

    let log = std::fs::read_to_string(dir.path().join("logs").join("db-recovery.log")).unwrap();
    assert!(log.contains("POST /restore -> 200"));
    assert!(log.contains("Manual restore requested: backup-2"));
}

#[test]
fn test_emergency_auto_recover_runs_worker() {
    let dir = TempDir::new().unwrap();
    prepare(dir.path());

    let addr = start_server(dir.path());
    let (status, body) = post(addr, "/auto-recover", "");
    assert_eq!(status, 200, "{}", body);
    assert!(body["output"].as_str().unwrap().contains("RESTORE"));

    assert!(run_cli(dir.path(), &["check"]).status.success());
}

#[test]
fn test_cli_backup_list_and_delete() {
    let dir = TempDir::new().unwrap();
    let seeded = run_cli(dir.path(), &["seed"]);
    assert!(seeded.status.success(), "{}", String::from_utf8_lossy(&seeded.stderr));

    assert!(run_cli(dir.path(), &["backup"]).status.success());
    let store = SnapshotStore::open(dir.path().join("backups")).unwrap();
    let backups = store.list().unwrap();
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].kind, BackupKind::Manual);

    let listed = run_cli(dir.path(), &["list"]);
    assert!(String::from_utf8_lossy(&listed.stdout).contains(&backups[0].filename));

    assert!(run_cli(dir.path(), &["delete", &backups[0].filename]).status.success());
    assert!(store.list().unwrap().is_empty());
    assert!(!run_cli(dir.path(), &["delete", &backups[0].filename]).status.success());
}

#[test]
fn test_cli_restore_time_before_first_snapshot_fails() {
    let dir = TempDir::new().unwrap();
    assert!(run_cli(dir.path(), &["seed"]).status.success());
    assert!(run_cli(dir.path(), &["backup"]).status.success());

    let out = run_cli(dir.path(), &["restore-time", "2000-01-01T00:00:00Z"]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("No snapshot available"));
}
