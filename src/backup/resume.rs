//! Resume analysis for aborted backups.
//!
//! A fatal error leaves `backup.tmp` behind. On the next run the temp
//! tree is inspected: if its manifest is compatible with the new backup
//! the already copied files are kept and marked, everything else is
//! cleaned out; otherwise the whole temp directory is discarded.

use anyhow::Error;
use log::{info, warn};

use std::collections::HashSet;

use crate::fs::{ClusterLayout, FileKind, Filesystem};

use super::builder::{DB_PATH_TABLESPACE, DB_PATH_WAL};
use super::manifest::{
    file_section, path_section, tablespace_level, Manifest, MANIFEST_NAME,
    LEVEL_BASE, SECTION_BACKUP, SECTION_BACKUP_OPTION, SECTION_BACKUP_TABLESPACE,
};

/// Name of the format version file inside a backup directory.
pub const VERSION_NAME: &str = "version";

/// Files already present in the temp tree, keyed by (level, path).
///
/// This is transient coordination state between the resume pass and the
/// copy executor; it is never serialized into a manifest.
#[derive(Debug, Default)]
pub struct ResumeState {
    exists: HashSet<(String, String)>,
}

impl ResumeState {

    pub fn new() -> Self {
        Self::default()
    }

    fn mark(&mut self, level: &str, path: &str) {
        self.exists.insert((level.to_string(), path.to_string()));
    }

    pub fn is_present(&self, level: &str, path: &str) -> bool {
        self.exists.contains(&(level.to_string(), path.to_string()))
    }

    pub fn len(&self) -> usize {
        self.exists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exists.is_empty()
    }
}

/// Inspect an existing temp backup directory and prepare it for reuse.
///
/// Returns the set of entries the copy executor may skip. The temp
/// directory exists (possibly empty) when this returns.
pub fn analyze<F: Filesystem>(
    fs: &F,
    layout: &ClusterLayout,
    new_manifest: &Manifest,
    resume_allowed: bool,
) -> Result<ResumeState, Error> {

    let tmp_path = layout.tmp_path();

    if !fs.exists(&tmp_path)? {
        fs.path_create(&tmp_path)?;
        return Ok(ResumeState::new());
    }

    if !resume_allowed {
        info!("removing aborted backup in {:?} (resume disabled)", tmp_path);
        fs.path_remove(&tmp_path)?;
        fs.path_create(&tmp_path)?;
        return Ok(ResumeState::new());
    }

    // load defensively: a half written manifest just means the aborted
    // backup is unusable
    let tmp_manifest = match Manifest::load(&tmp_path.join(MANIFEST_NAME)) {
        Ok(manifest) => Some(manifest),
        Err(err) => {
            warn!("aborted backup has unreadable manifest - {}", err);
            None
        }
    };

    let usable = match tmp_manifest {
        Some(ref tmp_manifest) => manifest_usable(tmp_manifest, new_manifest),
        None => false,
    };

    if !usable {
        info!("aborted backup in {:?} cannot be resumed, removing it", tmp_path);
        fs.path_remove(&tmp_path)?;
        fs.path_create(&tmp_path)?;
        return Ok(ResumeState::new());
    }

    info!("resuming aborted backup in {:?}", tmp_path);
    clean(fs, layout, new_manifest)
}

/// A temp manifest is usable iff the format version matches and the
/// backup derives the same way: both full, or same type with the same
/// prior. Option drift (compress/checksum/hardlink) also discards.
///
/// All fields are read as actual values; a missing field never matches
/// a present one.
fn manifest_usable(tmp_manifest: &Manifest, new_manifest: &Manifest) -> bool {
    let version = |manifest: &Manifest| {
        manifest.scalar_str(SECTION_BACKUP, "version").map(str::to_string)
    };
    if version(tmp_manifest).is_none() || version(tmp_manifest) != version(new_manifest) {
        return false;
    }

    for option in &["compress", "checksum", "hardlink"] {
        if tmp_manifest.scalar_bool(SECTION_BACKUP_OPTION, option)
            != new_manifest.scalar_bool(SECTION_BACKUP_OPTION, option)
        {
            return false;
        }
    }

    let backup_type = |manifest: &Manifest| {
        manifest.scalar_str(SECTION_BACKUP, "type").map(str::to_string)
    };
    let prior = |manifest: &Manifest| {
        manifest.scalar_str(SECTION_BACKUP, "prior").map(str::to_string)
    };

    match (backup_type(tmp_manifest), backup_type(new_manifest)) {
        (Some(ref old), Some(ref new)) if old == "full" && new == "full" => true,
        (Some(old), Some(new)) => old == new && prior(tmp_manifest) == prior(new_manifest),
        _ => false,
    }
}

/// Remove everything from the temp tree that the new manifest does not
/// account for, and mark what can be kept.
fn clean<F: Filesystem>(
    fs: &F,
    layout: &ClusterLayout,
    new_manifest: &Manifest,
) -> Result<ResumeState, Error> {

    let tmp_path = layout.tmp_path();

    // WAL and tablespace links are always rebuilt
    fs.path_remove(&tmp_path.join(LEVEL_BASE).join(DB_PATH_WAL))?;
    fs.path_remove(&tmp_path.join(LEVEL_BASE).join(DB_PATH_TABLESPACE))?;

    let mut state = ResumeState::new();
    let entries = fs.manifest(&tmp_path)?;

    // reverse lexicographic drains children before their directories
    for (name, info) in entries.iter().rev() {
        let (level, key) = match classify(name, new_manifest) {
            TempEntry::Keep => continue,
            TempEntry::Remove => {
                remove_entry(fs, &tmp_path.join(name), info.kind)?;
                continue;
            }
            TempEntry::Mapped { level, key } => (level, key),
        };

        match info.kind {
            FileKind::Directory => {
                if new_manifest.has_entry(&path_section(&level), key) {
                    state.mark(&level, key);
                } else {
                    fs.path_remove(&tmp_path.join(name))?;
                }
            }
            FileKind::File => {
                let entry = new_manifest.entry(&file_section(&level), key);
                let matches = entry
                    .map(|attrs| {
                        attrs.get("size").and_then(|value| value.as_integer())
                            == Some(info.size as i64)
                            && attrs
                                .get("modification_time")
                                .and_then(|value| value.as_integer())
                                == Some(info.modification_time)
                    })
                    .unwrap_or(false);

                if matches {
                    state.mark(&level, key);
                } else {
                    fs.file_remove(&tmp_path.join(name))?;
                }
            }
            FileKind::Link => {
                // backups contain no links, whatever this is goes away
                fs.file_remove(&tmp_path.join(name))?;
            }
        }
    }

    info!("aborted backup contributes {} reusable entries", state.len());

    Ok(state)
}

fn remove_entry<F: Filesystem>(
    fs: &F,
    path: &std::path::Path,
    kind: FileKind,
) -> Result<(), Error> {
    match kind {
        FileKind::Directory => fs.path_remove(path),
        _ => fs.file_remove(path),
    }
}

enum TempEntry<'a> {
    Keep,
    Remove,
    Mapped { level: String, key: &'a str },
}

/// Map a temp tree path onto a manifest (level, key) pair.
fn classify<'a>(name: &'a str, manifest: &Manifest) -> TempEntry<'a> {
    if name == MANIFEST_NAME || name == VERSION_NAME {
        return TempEntry::Keep;
    }

    if name == LEVEL_BASE || name == "tablespace" {
        return TempEntry::Keep;
    }

    if let Some(key) = strip_prefix(name, "base/") {
        return TempEntry::Mapped { level: LEVEL_BASE.to_string(), key };
    }

    if let Some(rest) = strip_prefix(name, "tablespace/") {
        return match rest.find('/') {
            None => {
                // a tablespace root directory
                if manifest.has_entry(SECTION_BACKUP_TABLESPACE, rest) {
                    TempEntry::Keep
                } else {
                    TempEntry::Remove
                }
            }
            Some(pos) => TempEntry::Mapped {
                level: tablespace_level(&rest[..pos]),
                key: &rest[pos + 1..],
            },
        };
    }

    TempEntry::Remove
}

fn strip_prefix<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    if name.starts_with(prefix) {
        Some(&name[prefix.len()..])
    } else {
        None
    }
}
