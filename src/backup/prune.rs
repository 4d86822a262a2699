//! Backup and WAL archive retention.
//!
//! Runs after a backup is published. Full retention cascades onto the
//! derived backups of an expired full; deletions proceed in reverse
//! label order so that an interrupted pass never leaves a differential
//! or incremental backup without its full ancestor. WAL retention prunes
//! the archive below the start position of an anchor backup.

use anyhow::Error;
use log::{info, warn};

use crate::config::RetentionOptions;
use crate::fs::{ClusterLayout, Filesystem};

use super::label::{ancestor_full, label_regex, BackupType};
use super::manifest::{Manifest, MANIFEST_NAME, SECTION_BACKUP};
use super::wal::archive_major_regex;

#[derive(Debug, Default)]
pub struct ExpireStats {
    pub backups_removed: u64,
    pub archive_paths_removed: u64,
    pub archive_files_removed: u64,
}

/// Apply the configured retention to the repository.
pub fn expire<F: Filesystem>(
    fs: &F,
    layout: &ClusterLayout,
    options: &RetentionOptions,
) -> Result<ExpireStats, Error> {

    options.validate()?;

    let mut stats = ExpireStats::default();

    if let Some(keep) = options.retention_full {
        expire_full(fs, layout, keep as usize, &mut stats)?;
    }

    if let Some(keep) = options.retention_diff {
        expire_diff(fs, layout, keep as usize, &mut stats)?;
    }

    match (options.retention_archive_type, options.retention_archive) {
        (Some(backup_type), Some(keep)) => {
            expire_archive(fs, layout, backup_type, keep as usize, &mut stats)?;
        }
        _ => info!("archive retention not configured - WAL segments are kept indefinitely"),
    }

    Ok(stats)
}

/// Keep the `keep` most recent full backups; every older full is removed
/// together with the backups derived from it.
fn expire_full<F: Filesystem>(
    fs: &F,
    layout: &ClusterLayout,
    keep: usize,
    stats: &mut ExpireStats,
) -> Result<(), Error> {

    let fulls = fs.list(layout.repo_path(), &label_regex(true, false, false))?;
    if fulls.len() <= keep {
        return Ok(());
    }
    let expired = &fulls[..fulls.len() - keep];

    let all = fs.list(layout.repo_path(), &label_regex(true, true, true))?;

    // reverse label order: a full goes last, after its derived backups
    for label in all.iter().rev() {
        if expired.iter().any(|full| ancestor_full(label) == full.as_str()) {
            remove_backup(fs, layout, label, stats)?;
        }
    }

    Ok(())
}

/// Keep the `keep` most recent differential backups; every differential
/// or incremental older than the last kept one is removed.
fn expire_diff<F: Filesystem>(
    fs: &F,
    layout: &ClusterLayout,
    keep: usize,
    stats: &mut ExpireStats,
) -> Result<(), Error> {

    let diffs = fs.list(layout.repo_path(), &label_regex(false, true, false))?;
    if diffs.len() <= keep {
        return Ok(());
    }
    let boundary = diffs[diffs.len() - keep].clone();

    let derived = fs.list(layout.repo_path(), &label_regex(false, true, true))?;
    for label in derived.iter().rev() {
        if label.as_str() < boundary.as_str() {
            remove_backup(fs, layout, label, stats)?;
        }
    }

    Ok(())
}

/// Prune the WAL archive below the start position of the anchor backup.
///
/// The anchor is the `keep`-th most recent backup of `backup_type`.
/// When there are not enough backups of that type, full retention falls
/// back to the oldest full; otherwise all WAL is kept.
fn expire_archive<F: Filesystem>(
    fs: &F,
    layout: &ClusterLayout,
    backup_type: BackupType,
    keep: usize,
    stats: &mut ExpireStats,
) -> Result<(), Error> {

    let filter = match backup_type {
        BackupType::Full => label_regex(true, false, false),
        BackupType::Diff => label_regex(false, true, false),
        BackupType::Incr => label_regex(false, false, true),
    };
    let candidates = fs.list(layout.repo_path(), &filter)?;

    let anchor = if candidates.len() >= keep {
        Some(candidates[candidates.len() - keep].clone())
    } else if backup_type == BackupType::Full {
        candidates.first().cloned()
    } else {
        None
    };

    let anchor = match anchor {
        Some(anchor) => anchor,
        None => {
            info!("no anchor backup for archive retention - keeping all WAL");
            return Ok(());
        }
    };

    let manifest = Manifest::load(&layout.backup_path(&anchor).join(MANIFEST_NAME))?;
    let archive_start = match manifest.scalar_str(SECTION_BACKUP, "archive-start") {
        Some(position) => position.to_string(),
        None => {
            warn!(
                "anchor backup {} has no archive start position - keeping all WAL",
                anchor
            );
            return Ok(());
        }
    };

    info!("pruning WAL archive below {} (anchor backup {})", archive_start, anchor);

    let major_boundary = &archive_start[..16];
    let archive_path = layout.archive_path();

    for dir in fs.list(&archive_path, archive_major_regex())? {
        if dir.as_str() < major_boundary {
            info!("expire WAL directory {}", dir);
            fs.path_remove(&archive_path.join(&dir))?;
            stats.archive_paths_removed += 1;
        } else if dir == major_boundary {
            let dir_path = archive_path.join(&dir);
            let any = regex::Regex::new("^.").unwrap();
            for file in fs.list(&dir_path, &any)? {
                if file.len() >= 24 && &file[..24] < &archive_start[..24] {
                    info!("expire WAL segment {}", file);
                    fs.file_remove(&dir_path.join(&file))?;
                    stats.archive_files_removed += 1;
                }
            }
        }
    }

    Ok(())
}

fn remove_backup<F: Filesystem>(
    fs: &F,
    layout: &ClusterLayout,
    label: &str,
    stats: &mut ExpireStats,
) -> Result<(), Error> {
    info!("expire backup {}", label);
    fs.path_remove(&layout.backup_path(label))?;
    stats.backups_removed += 1;
    Ok(())
}
