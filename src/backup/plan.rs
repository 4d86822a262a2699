//! Copy planning.
//!
//! Classifies every file entry of the new manifest into one of four
//! classes: referenced entries are skipped (or hard linked from the
//! prior backup), entries already present in the resumed temp tree may
//! only need a fresh checksum, everything else is copied. Copy jobs are
//! keyed by `(tablespace index, size, sequence)` so iteration order is
//! deterministic and the size-aware partitioning of the executor stays
//! stable across a resume.

use anyhow::{format_err, Error};

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::BackupOptions;
use crate::fs::{ClusterLayout, Filesystem, COMPRESS_EXT};
use crate::tools;

use super::manifest::{
    file_section, path_section, tablespace_level, Manifest, LEVEL_BASE,
    SECTION_BACKUP_PATH, SECTION_BACKUP_TABLESPACE,
};
use super::resume::ResumeState;

#[derive(Clone, Debug, PartialEq)]
pub enum JobKind {
    /// Copy source to temp; `exists` entries are already in place from a
    /// resumed backup and only need their checksum refreshed.
    Copy { exists: bool },
    /// Re-hash an already present temp file without copying.
    ChecksumOnly,
}

/// One unit of work for the copy executor.
#[derive(Clone, Debug)]
pub struct CopyJob {
    pub level: String,
    pub path: String,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub size: u64,
    pub mode: Option<u32>,
    pub modification_time: Option<i64>,
    pub kind: JobKind,
}

#[derive(Debug, Default)]
pub struct CopyPlan {
    pub jobs: Vec<CopyJob>,
    /// Entries skipped because a prior backup holds their bytes.
    pub referenced: u64,
    /// Hard links created into the temp tree.
    pub linked: u64,
}

/// Subdirectory of a backup holding a level's files.
pub fn level_subdir(level: &str) -> PathBuf {
    if level == LEVEL_BASE {
        PathBuf::from(LEVEL_BASE)
    } else if let Some(name) = level.strip_prefix("tablespace:") {
        PathBuf::from("tablespace").join(name)
    } else {
        PathBuf::from(level)
    }
}

/// Build the copy plan for `manifest` and create the target directory
/// skeleton plus any hard links.
///
/// Directories are created here because the temp tree is single-writer:
/// the coordinator creates directories, workers only write leaf files.
pub fn build_plan<F: Filesystem>(
    fs: &F,
    layout: &ClusterLayout,
    manifest: &Manifest,
    resume: &ResumeState,
    options: &BackupOptions,
) -> Result<CopyPlan, Error> {

    let tmp_path = layout.tmp_path();

    let mut levels = vec![LEVEL_BASE.to_string()];
    for (name, _) in manifest.entries(SECTION_BACKUP_TABLESPACE) {
        levels.push(tablespace_level(name));
    }

    let mut plan = CopyPlan::default();
    let mut ordered = BTreeMap::new();
    let mut sequence: u64 = 0;

    for (tablespace_idx, level) in levels.iter().enumerate() {
        let source_root = manifest
            .scalar_str(SECTION_BACKUP_PATH, level)
            .ok_or_else(|| format_err!("manifest has no source path for level '{}'", level))?;
        let source_root = PathBuf::from(source_root);
        let dest_root = tmp_path.join(level_subdir(level));

        fs.path_create(&dest_root)?;
        for (path, _) in manifest.entries(&path_section(level)) {
            fs.path_create(&dest_root.join(path))?;
        }

        for (path, attrs) in manifest.entries(&file_section(level)) {
            let size = attrs
                .get("size")
                .and_then(|value| value.as_integer())
                .ok_or_else(|| format_err!("file entry '{}' has no size", path))?
                as u64;

            let destination = dest_root.join(destination_name(path, options.compress));

            if let Some(reference) = attrs.get("reference").and_then(|value| value.as_str()) {
                if options.hardlink {
                    let link_source = layout
                        .backup_path(reference)
                        .join(level_subdir(level))
                        .join(destination_name(path, options.compress));
                    fs.link_create(&link_source, &destination, true)?;
                    plan.linked += 1;
                } else {
                    plan.referenced += 1;
                }
                continue;
            }

            let exists = resume.is_present(level, path);
            let kind = if exists && options.checksum && options.hardlink {
                JobKind::ChecksumOnly
            } else {
                JobKind::Copy { exists }
            };

            let mode = attrs
                .get("permission")
                .and_then(|value| value.as_str())
                .map(tools::mode_from_octal)
                .transpose()?;

            let job = CopyJob {
                level: level.clone(),
                path: path.to_string(),
                source: source_root.join(path),
                destination,
                size,
                mode,
                modification_time: attrs
                    .get("modification_time")
                    .and_then(|value| value.as_integer()),
                kind,
            };

            ordered.insert((tablespace_idx, size, sequence), job);
            sequence += 1;
        }
    }

    plan.jobs = ordered.into_iter().map(|(_, job)| job).collect();

    Ok(plan)
}

fn destination_name(path: &str, compress: bool) -> String {
    if compress {
        format!("{}.{}", path, COMPRESS_EXT)
    } else {
        path.to_string()
    }
}
