//! Manifest builder.
//!
//! Walks a cluster data directory (recursing through tablespace links
//! under `pg_tblspc/`) and fills a manifest with path, file and link
//! entries. When a prior manifest is given, files whose size, inode and
//! modification time are unchanged get a `reference` to the backup that
//! still holds their bytes instead of being copied again.
//!
//! The inode-plus-mtime comparison is the only unchanged oracle
//! available without re-reading file contents; content verification is
//! a separate concern.

use anyhow::{format_err, Error};

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::fs::{FileKind, Filesystem};
use crate::tools;

use super::manifest::{
    file_section, link_section, path_section, tablespace_level, Manifest,
    LEVEL_BASE, SECTION_BACKUP, SECTION_BACKUP_PATH, SECTION_BACKUP_TABLESPACE,
};

/// WAL directory inside the cluster; contents are collected from the
/// archive instead of being copied from the live cluster.
pub const DB_PATH_WAL: &str = "pg_xlog";

/// Tablespace link directory inside the cluster.
pub const DB_PATH_TABLESPACE: &str = "pg_tblspc";

/// Lock file of a running postmaster; never backed up.
pub const DB_FILE_POSTMASTER_PID: &str = "postmaster.pid";

/// Walk the cluster at `db_path` and fill `manifest`.
///
/// `tablespace_map` maps tablespace oids to names; an unmapped oid
/// falls back to the oid itself (offline backups cannot query names).
pub fn build_manifest<F: Filesystem>(
    fs: &F,
    manifest: &mut Manifest,
    prior: Option<&Manifest>,
    db_path: &Path,
    tablespace_map: &BTreeMap<String, String>,
) -> Result<(), Error> {

    manifest.set_scalar(
        SECTION_BACKUP_PATH,
        LEVEL_BASE,
        db_path.to_string_lossy().into_owned(),
    );

    let mut references = BTreeSet::new();

    build_level(fs, manifest, prior, &mut references, db_path, LEVEL_BASE, tablespace_map)?;

    if !references.is_empty() {
        let joined = references.into_iter().collect::<Vec<_>>().join(",");
        manifest.set_scalar(SECTION_BACKUP, "reference", joined);
    }

    Ok(())
}

fn build_level<F: Filesystem>(
    fs: &F,
    manifest: &mut Manifest,
    prior: Option<&Manifest>,
    references: &mut BTreeSet<String>,
    root: &Path,
    level: &str,
    tablespace_map: &BTreeMap<String, String>,
) -> Result<(), Error> {

    let entries = fs.manifest(root)?;

    for (name, info) in &entries {
        if level == LEVEL_BASE {
            if name == DB_FILE_POSTMASTER_PID {
                continue;
            }
            // the WAL directory itself is kept so collection has a place
            // to write into, its contents come from the archive
            if name.starts_with(&format!("{}/", DB_PATH_WAL)) {
                continue;
            }
        }

        match info.kind {
            FileKind::Directory => {
                let section = path_section(level);
                manifest.set_attr(&section, name, "user", info.user.as_str());
                manifest.set_attr(&section, name, "group", info.group.as_str());
                manifest.set_attr(&section, name, "permission", tools::mode_to_octal(info.permission));
            }
            FileKind::File => {
                let section = file_section(level);
                manifest.set_attr(&section, name, "user", info.user.as_str());
                manifest.set_attr(&section, name, "group", info.group.as_str());
                manifest.set_attr(&section, name, "permission", tools::mode_to_octal(info.permission));
                manifest.set_attr(&section, name, "size", info.size);
                manifest.set_attr(&section, name, "inode", info.inode);
                manifest.set_attr(&section, name, "modification_time", info.modification_time);

                if let Some(prior) = prior {
                    diff_file(manifest, prior, references, level, name, info)?;
                }
            }
            FileKind::Link => {
                let destination = info.link_destination.as_deref().ok_or_else(|| {
                    format_err!("link entry '{}' has no destination", name)
                })?;

                let section = link_section(level);
                manifest.set_attr(&section, name, "user", info.user.as_str());
                manifest.set_attr(&section, name, "group", info.group.as_str());
                manifest.set_attr(&section, name, "link_destination", destination);

                let tablespace_prefix = format!("{}/", DB_PATH_TABLESPACE);
                if level == LEVEL_BASE && name.starts_with(&tablespace_prefix) {
                    let oid = &name[tablespace_prefix.len()..];
                    let tablespace_name = tablespace_map
                        .get(oid)
                        .cloned()
                        .unwrap_or_else(|| oid.to_string());

                    manifest.set_attr(SECTION_BACKUP_TABLESPACE, &tablespace_name, "link", oid);
                    manifest.set_attr(SECTION_BACKUP_TABLESPACE, &tablespace_name, "path", destination);

                    let tablespace = tablespace_level(&tablespace_name);
                    manifest.set_scalar(SECTION_BACKUP_PATH, &tablespace, destination);

                    build_level(
                        fs,
                        manifest,
                        prior,
                        references,
                        Path::new(destination),
                        &tablespace,
                        tablespace_map,
                    )?;
                }
            }
        }
    }

    Ok(())
}

/// Attach a `reference` when the prior manifest shows the file unchanged.
fn diff_file(
    manifest: &mut Manifest,
    prior: &Manifest,
    references: &mut BTreeSet<String>,
    level: &str,
    name: &str,
    info: &crate::fs::FileInfo,
) -> Result<(), Error> {

    let section = file_section(level);

    let prior_entry = match prior.entry(&section, name) {
        Some(entry) => entry,
        None => return Ok(()),
    };

    let unchanged = prior_entry.get("size").and_then(|value| value.as_integer())
        == Some(info.size as i64)
        && prior_entry.get("inode").and_then(|value| value.as_integer())
            == Some(info.inode as i64)
        && prior_entry.get("modification_time").and_then(|value| value.as_integer())
            == Some(info.modification_time);

    if !unchanged {
        return Ok(());
    }

    let reference = match prior_entry.get("reference").and_then(|value| value.as_str()) {
        Some(reference) => reference.to_string(),
        None => prior
            .scalar_str(SECTION_BACKUP, "label")
            .ok_or_else(|| format_err!("prior manifest has no label"))?
            .to_string(),
    };

    manifest.set_attr(&section, name, "reference", reference.as_str());

    if let Some(checksum) = prior_entry.get("checksum").and_then(|value| value.as_str()) {
        manifest.set_attr(&section, name, "checksum", checksum);
    }

    references.insert(reference);

    Ok(())
}
