//! Retention over synthetic backup trees and a synthetic WAL archive.

mod common;

use common::Fixture;

use pgbackup::backup::{
    expire, label_regex, Manifest, BackupType, MANIFEST_NAME, SECTION_BACKUP,
};
use pgbackup::config::RetentionOptions;
use pgbackup::fs::{Filesystem, LocalFs};

/// Fabricate a published backup: directory plus a minimal manifest.
fn make_backup(fixture: &Fixture, label: &str, backup_type: &str, archive_start: Option<&str>) {
    let path = fixture.backup_path(label);
    std::fs::create_dir_all(path.join("base")).unwrap();

    let mut manifest = Manifest::new();
    manifest.set_scalar(SECTION_BACKUP, "label", label);
    manifest.set_scalar(SECTION_BACKUP, "type", backup_type);
    manifest.set_scalar(SECTION_BACKUP, "version", "test");
    if let Some(position) = archive_start {
        manifest.set_scalar(SECTION_BACKUP, "archive-start", position);
    }
    manifest.save(&path.join(MANIFEST_NAME)).unwrap();
}

fn surviving_labels(fixture: &Fixture) -> Vec<String> {
    LocalFs::new()
        .list(&fixture.repo, &label_regex(true, true, true))
        .unwrap()
}

const F1: &str = "20240101-000000F";
const F1_D1: &str = "20240101-000000F_20240102-000000D";
const F1_I1: &str = "20240101-000000F_20240103-000000I";
const F2: &str = "20240104-000000F";
const F2_I1: &str = "20240104-000000F_20240105-000000I";
const F3: &str = "20240106-000000F";

fn standard_repo() -> Fixture {
    let fixture = Fixture::new();
    make_backup(&fixture, F1, "full", Some("000000010000000100000001"));
    make_backup(&fixture, F1_D1, "diff", Some("000000010000000100000002"));
    make_backup(&fixture, F1_I1, "incr", Some("000000010000000100000003"));
    make_backup(&fixture, F2, "full", Some("000000010000000200000001"));
    make_backup(&fixture, F2_I1, "incr", Some("000000010000000200000002"));
    make_backup(&fixture, F3, "full", Some("000000010000000200000003"));
    fixture
}

#[test]
fn test_cascading_full_retention_with_archive_pruning() {
    let fixture = standard_repo();

    // archive: one whole directory below the boundary, one straddling it
    fixture.archive_segment("000000010000000100000001");
    fixture.archive_segment("000000010000000100000002");
    fixture.archive_segment("000000010000000200000001");
    fixture.archive_segment("000000010000000200000002");
    fixture.archive_segment("000000010000000200000003");
    fixture.archive_segment("000000010000000200000004");

    let options = RetentionOptions::new()
        .retention_full(Some(2))
        .retention_diff(Some(1))
        .retention_archive(Some(BackupType::Full), Some(1));

    let stats = expire(&LocalFs::new(), &fixture.layout(), &options).unwrap();

    // F1 and everything derived from it is gone
    assert_eq!(stats.backups_removed, 3);
    assert_eq!(surviving_labels(&fixture), vec![F2, F2_I1, F3]);

    // WAL pruned up to F3's start position
    assert!(!fixture.repo.join("archive/0000000100000001").exists());
    let boundary_dir = fixture.repo.join("archive/0000000100000002");
    assert!(!boundary_dir.join("000000010000000200000001").exists());
    assert!(!boundary_dir.join("000000010000000200000002").exists());
    assert!(boundary_dir.join("000000010000000200000003").exists());
    assert!(boundary_dir.join("000000010000000200000004").exists());

    assert_eq!(stats.archive_paths_removed, 1);
    assert_eq!(stats.archive_files_removed, 2);
}

#[test]
fn test_full_retention_keeps_requested_count() {
    let fixture = standard_repo();

    let options = RetentionOptions::new().retention_full(Some(1));
    expire(&LocalFs::new(), &fixture.layout(), &options).unwrap();

    // only the newest full survives, no orphaned derived backups
    assert_eq!(surviving_labels(&fixture), vec![F3]);

    // asking for more fulls than exist removes nothing
    let options = RetentionOptions::new().retention_full(Some(5));
    let stats = expire(&LocalFs::new(), &fixture.layout(), &options).unwrap();
    assert_eq!(stats.backups_removed, 0);
    assert_eq!(surviving_labels(&fixture), vec![F3]);
}

#[test]
fn test_diff_retention_removes_older_derived_backups() {
    let fixture = Fixture::new();
    make_backup(&fixture, F1, "full", None);
    make_backup(&fixture, F1_D1, "diff", None);
    make_backup(&fixture, F1_I1, "incr", None);
    let d2 = "20240101-000000F_20240107-000000D";
    make_backup(&fixture, d2, "diff", None);

    let options = RetentionOptions::new().retention_diff(Some(1));
    let stats = expire(&LocalFs::new(), &fixture.layout(), &options).unwrap();

    // the older diff goes, and so does the incremental that sorts below
    // the kept diff; the full stays
    assert_eq!(stats.backups_removed, 2);
    assert_eq!(surviving_labels(&fixture), vec![F1.to_string(), d2.to_string()]);
}

#[test]
fn test_unset_archive_retention_keeps_wal() {
    let fixture = standard_repo();
    fixture.archive_segment("000000010000000100000001");

    let options = RetentionOptions::new().retention_full(Some(1));
    expire(&LocalFs::new(), &fixture.layout(), &options).unwrap();

    assert!(fixture
        .repo
        .join("archive/0000000100000001/000000010000000100000001")
        .exists());
}

#[test]
fn test_archive_retention_falls_back_to_oldest_full() {
    let fixture = standard_repo();
    fixture.archive_segment("000000010000000100000001");
    fixture.archive_segment("000000010000000200000001");

    // asking for more anchor candidates than fulls exist falls back to
    // the oldest full
    let options = RetentionOptions::new()
        .retention_archive(Some(BackupType::Full), Some(5));
    let stats = expire(&LocalFs::new(), &fixture.layout(), &options).unwrap();

    // anchored on F1: nothing below its start position
    assert_eq!(stats.archive_paths_removed, 0);
    assert_eq!(stats.archive_files_removed, 0);
}

#[test]
fn test_retention_validation_rejects_zero() {
    let fixture = standard_repo();
    let options = RetentionOptions::new().retention_full(Some(0));
    assert!(expire(&LocalFs::new(), &fixture.layout(), &options).is_err());
}
