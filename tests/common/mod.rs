//! Shared fixtures for the integration tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Error;
use chrono::{DateTime, TimeZone, Utc};

use pgbackup::backup::BackupType;
use pgbackup::client::DbClient;
use pgbackup::config::BackupOptions;
use pgbackup::fs::ClusterLayout;

/// Scripted database client: returns fixed archive positions and
/// records the bracketing calls.
pub struct TestDb {
    pub start: String,
    pub stop: String,
    pub version: u32,
    pub tablespaces: BTreeMap<String, String>,
    pub started: Vec<(String, bool)>,
    pub stopped: usize,
}

impl TestDb {

    pub fn new(start: &str, stop: &str) -> Self {
        Self {
            start: start.to_string(),
            stop: stop.to_string(),
            version: 90500,
            tablespaces: BTreeMap::new(),
            started: Vec::new(),
            stopped: 0,
        }
    }
}

impl DbClient for TestDb {

    fn backup_start(&mut self, label: &str, fast: bool) -> Result<String, Error> {
        self.started.push((label.to_string(), fast));
        Ok(self.start.clone())
    }

    fn backup_stop(&mut self) -> Result<String, Error> {
        self.stopped += 1;
        Ok(self.stop.clone())
    }

    fn tablespace_map(&mut self) -> Result<BTreeMap<String, String>, Error> {
        Ok(self.tablespaces.clone())
    }

    fn db_version(&mut self) -> Result<u32, Error> {
        Ok(self.version)
    }
}

/// A scratch cluster with a data directory and a backup repository.
pub struct Fixture {
    _dir: tempfile::TempDir,
    pub db: PathBuf,
    pub repo: PathBuf,
}

impl Fixture {

    pub fn new() -> Self {
        init_logger();
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("db");
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(db.join("A")).unwrap();
        std::fs::create_dir_all(&repo).unwrap();
        Self { _dir: dir, db, repo }
    }

    /// The standard two-file cluster: one small, one just above the
    /// large-file threshold.
    pub fn with_standard_files() -> Self {
        let fixture = Self::new();
        fixture.write_db_file("A/1.dat", 100, 1000);
        fixture.write_db_file("A/2.dat", 65537, 1001);
        fixture
    }

    pub fn layout(&self) -> ClusterLayout {
        ClusterLayout::new(&self.db, &self.repo)
    }

    /// Write `size` patterned bytes at `rel` below the data directory
    /// and pin the modification time.
    pub fn write_db_file(&self, rel: &str, size: usize, mtime: i64) {
        let path = self.db.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let data: Vec<u8> = (0..size).map(|idx| (idx % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();
        set_mtime(&path, mtime);
    }

    /// Put a WAL segment into the archive, under its major directory.
    pub fn archive_segment(&self, file_name: &str) {
        let major = &file_name[..16];
        let dir = self.repo.join("archive").join(major);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(file_name), format!("wal:{}", file_name)).unwrap();
    }

    pub fn backup_path(&self, label: &str) -> PathBuf {
        self.repo.join(label)
    }
}

/// Honor RUST_LOG in test runs; safe to call from every fixture.
pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn set_mtime(path: &Path, mtime: i64) {
    use nix::sys::time::{TimeVal, TimeValLike};
    let time = TimeVal::seconds(mtime);
    nix::sys::stat::utimes(path, &time, &time).unwrap();
}

/// Options tuned for tests: short archive wait, checksums on.
pub fn test_options(backup_type: BackupType) -> BackupOptions {
    BackupOptions::new(backup_type)
        .process_max(2)
        .archive_timeout(Duration::from_secs(2))
}

pub fn at(timestamp: &str) -> DateTime<Utc> {
    Utc.datetime_from_str(timestamp, "%Y%m%d-%H%M%S").unwrap()
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = openssl::sha::Sha256::new();
    hasher.update(data);
    pgbackup::tools::digest_to_hex(&hasher.finish())
}
