//! Resume of aborted backups.

mod common;

use common::{at, test_options, Fixture, TestDb};

use pgbackup::backup::{BackupEngine, BackupType, Manifest, MANIFEST_NAME, SECTION_BACKUP};
use pgbackup::fs::LocalFs;

const SEG_A: &str = "00000001000000000000000A";
const SEG_B: &str = "00000001000000000000000B";

fn run_backup(fixture: &Fixture, backup_type: BackupType, now: &str) -> pgbackup::backup::BackupSummary {
    let mut engine = BackupEngine::new(
        LocalFs::new(),
        TestDb::new(SEG_A, SEG_B),
        fixture.layout(),
        test_options(backup_type),
    );
    engine.run(at(now)).unwrap()
}

#[test]
fn test_resume_reuses_copied_files_and_matches_references() {
    let fixture = Fixture::with_standard_files();
    fixture.archive_segment(SEG_A);
    fixture.archive_segment(SEG_B);

    let full = run_backup(&fixture, BackupType::Full, "20240401-090000");

    fixture.write_db_file("A/2.dat", 65537, 2000);

    // run a complete incremental, then disguise it as an aborted one
    let reference_run = run_backup(&fixture, BackupType::Incr, "20240402-090000");
    let reference_manifest = Manifest::load(
        &fixture.backup_path(&reference_run.label).join(MANIFEST_NAME),
    )
    .unwrap();
    let expected_references = reference_manifest
        .scalar_str(SECTION_BACKUP, "reference")
        .unwrap()
        .to_string();

    std::fs::rename(
        fixture.backup_path(&reference_run.label),
        fixture.repo.join("backup.tmp"),
    )
    .unwrap();

    let resumed = run_backup(&fixture, BackupType::Incr, "20240403-090000");

    // the already copied file was reused, nothing was copied again
    assert_eq!(resumed.copied, 0);
    assert_eq!(resumed.referenced, 1);

    let manifest =
        Manifest::load(&fixture.backup_path(&resumed.label).join(MANIFEST_NAME)).unwrap();

    // same reference set as the uninterrupted run
    assert_eq!(
        manifest.scalar_str(SECTION_BACKUP, "reference"),
        Some(expected_references.as_str())
    );
    assert_eq!(
        manifest.attr_str("base:file", "A/1.dat", "reference"),
        Some(full.label.as_str())
    );

    // the reused file is byte identical to the source
    let copied = std::fs::read(fixture.backup_path(&resumed.label).join("base/A/2.dat")).unwrap();
    let source = std::fs::read(fixture.db.join("A/2.dat")).unwrap();
    assert_eq!(copied, source);

    // the temp directory was published
    assert!(!fixture.repo.join("backup.tmp").exists());
}

#[test]
fn test_unreadable_tmp_manifest_discards_the_aborted_backup() {
    let fixture = Fixture::with_standard_files();
    fixture.archive_segment(SEG_A);
    fixture.archive_segment(SEG_B);

    let tmp = fixture.repo.join("backup.tmp");
    std::fs::create_dir_all(tmp.join("base")).unwrap();
    std::fs::write(tmp.join("backup.manifest"), b"not a manifest").unwrap();
    std::fs::write(tmp.join("base/junk.dat"), b"junk").unwrap();

    let summary = run_backup(&fixture, BackupType::Full, "20240401-090000");

    // the garbage tree was discarded, the backup ran from scratch
    assert_eq!(summary.copied, 2);
    assert!(!fixture
        .backup_path(&summary.label)
        .join("base/junk.dat")
        .exists());
}

#[test]
fn test_type_mismatch_discards_the_aborted_backup() {
    let fixture = Fixture::with_standard_files();
    fixture.archive_segment(SEG_A);
    fixture.archive_segment(SEG_B);

    let full = run_backup(&fixture, BackupType::Full, "20240401-090000");
    let second = run_backup(&fixture, BackupType::Full, "20240402-090000");

    // disguise the second full as an aborted tree, then ask for an
    // incremental: type full vs incr cannot be resumed
    std::fs::rename(
        fixture.backup_path(&second.label),
        fixture.repo.join("backup.tmp"),
    )
    .unwrap();

    let incr = run_backup(&fixture, BackupType::Incr, "20240403-090000");

    assert!(incr.label.ends_with('I'));
    assert_eq!(incr.referenced, 2);
    assert_eq!(incr.copied, 0);
    assert_eq!(
        Manifest::load(&fixture.backup_path(&incr.label).join(MANIFEST_NAME))
            .unwrap()
            .scalar_str(SECTION_BACKUP, "prior"),
        Some(full.label.as_str())
    );
}
