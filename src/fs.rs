//! Filesystem primitive layer.
//!
//! All file access of the backup engine goes through the [Filesystem]
//! trait so the engine never touches `std::fs` directly. The local
//! implementation is [LocalFs]. Worker threads of the copy executor get
//! their own clone, so there is no shared mutable state inside the
//! filesystem object across workers.

use anyhow::{bail, format_err, Error};
use nix::sys::time::{TimeVal, TimeValLike};
use regex::Regex;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::tools;

/// Extension used for compressed files in backups and the WAL archive.
pub const COMPRESS_EXT: &str = "zst";

const COMPRESS_LEVEL: i32 = 3;

/// Name of the in-progress backup directory below the repository root.
pub const BACKUP_TMP_NAME: &str = "backup.tmp";

/// Name of the WAL archive directory below the repository root.
pub const ARCHIVE_DIR_NAME: &str = "archive";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    Link,
}

/// Stat information for a single filesystem entry.
#[derive(Clone, Debug)]
pub struct FileInfo {
    pub kind: FileKind,
    pub user: String,
    pub group: String,
    pub permission: u32,
    pub size: u64,
    pub inode: u64,
    pub modification_time: i64,
    pub link_destination: Option<String>,
}

/// Options for [Filesystem::copy].
#[derive(Clone, Debug, Default)]
pub struct CopyOptions {
    /// Source is zstd compressed and must be decompressed while reading.
    pub source_compressed: bool,
    /// Compress the destination.
    pub compress: bool,
    /// A missing source file is not an error (returns `Ok(None)`).
    pub ignore_missing: bool,
    /// Permission mode to set on the destination.
    pub mode: Option<u32>,
    /// Modification time (epoch seconds) to set on the destination.
    pub modification_time: Option<i64>,
    /// Create missing parent directories of the destination.
    pub create_dirs: bool,
}

pub trait Filesystem: Send {
    fn exists(&self, path: &Path) -> Result<bool, Error>;

    /// Stat a single entry without following symlinks.
    fn stat(&self, path: &Path) -> Result<FileInfo, Error>;

    /// Non-recursive listing of entry names matching `filter`, sorted
    /// ascending. A missing directory yields an empty list.
    fn list(&self, path: &Path, filter: &Regex) -> Result<Vec<String>, Error>;

    /// Recursive listing of everything below `path` (links not followed),
    /// keyed by relative path, sorted ascending.
    fn manifest(&self, path: &Path) -> Result<BTreeMap<String, FileInfo>, Error>;

    /// Copy `src` to `dst`. Returns the destination size, or `Ok(None)`
    /// when the source is missing and `ignore_missing` is set.
    fn copy(&self, src: &Path, dst: &Path, options: &CopyOptions) -> Result<Option<u64>, Error>;

    /// SHA-256 of the file contents as lowercase hex, decompressing
    /// first when `compressed` is set.
    fn hash(&self, path: &Path, compressed: bool) -> Result<String, Error>;

    /// Create a hard or symbolic link at `dst`. An existing `dst` is
    /// replaced.
    fn link_create(&self, src: &Path, dst: &Path, hard: bool) -> Result<(), Error>;

    fn path_create(&self, path: &Path) -> Result<(), Error>;

    /// Remove a directory tree. Removing a path that is already gone is
    /// not an error, so interrupted removals can be repeated.
    fn path_remove(&self, path: &Path) -> Result<(), Error>;

    fn file_remove(&self, path: &Path) -> Result<(), Error>;

    fn rename(&self, src: &Path, dst: &Path) -> Result<(), Error>;
}

/// Filesystem implementation backed by the local kernel.
#[derive(Clone)]
pub struct LocalFs;

impl LocalFs {

    pub fn new() -> Self {
        Self
    }

    fn file_info(metadata: &std::fs::Metadata, link_destination: Option<String>) -> Result<FileInfo, Error> {
        let file_type = metadata.file_type();
        let kind = if file_type.is_symlink() {
            FileKind::Link
        } else if file_type.is_dir() {
            FileKind::Directory
        } else if file_type.is_file() {
            FileKind::File
        } else {
            return Err(crate::error::BackupError::Assert(
                "unsupported file type (not a file, directory or symlink)".to_string(),
            )
            .into());
        };

        Ok(FileInfo {
            kind,
            user: user_name(metadata.uid()),
            group: group_name(metadata.gid()),
            permission: metadata.mode() & 0o7777,
            size: metadata.len(),
            inode: metadata.ino(),
            modification_time: metadata.mtime(),
            link_destination,
        })
    }
}

fn user_name(uid: u32) -> String {
    match nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}

fn group_name(gid: u32) -> String {
    match nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid)) {
        Ok(Some(group)) => group.name,
        _ => gid.to_string(),
    }
}

fn hash_reader<R: Read>(mut reader: R) -> Result<String, Error> {
    let mut hasher = openssl::sha::Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(count) => hasher.update(&buffer[..count]),
            Err(ref err) if err.kind() == ErrorKind::Interrupted => { /* try again */ }
            Err(err) => bail!("read failed - {}", err),
        }
    }
    Ok(tools::digest_to_hex(&hasher.finish()))
}

impl Filesystem for LocalFs {

    fn exists(&self, path: &Path) -> Result<bool, Error> {
        match std::fs::symlink_metadata(path) {
            Ok(_) => Ok(true),
            Err(ref err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => bail!("stat {:?} failed - {}", path, err),
        }
    }

    fn stat(&self, path: &Path) -> Result<FileInfo, Error> {
        let metadata = std::fs::symlink_metadata(path)
            .map_err(|err| format_err!("stat {:?} failed - {}", path, err))?;

        let link_destination = if metadata.file_type().is_symlink() {
            let target = std::fs::read_link(path)
                .map_err(|err| format_err!("readlink {:?} failed - {}", path, err))?;
            Some(target.to_string_lossy().into_owned())
        } else {
            None
        };

        Self::file_info(&metadata, link_destination)
    }

    fn list(&self, path: &Path, filter: &Regex) -> Result<Vec<String>, Error> {
        let read_dir = match std::fs::read_dir(path) {
            Ok(iter) => iter,
            Err(ref err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => bail!("list {:?} failed - {}", path, err),
        };

        let mut names = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|err| format_err!("list {:?} failed - {}", path, err))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if filter.is_match(&name) {
                names.push(name);
            }
        }
        names.sort();

        Ok(names)
    }

    fn manifest(&self, path: &Path) -> Result<BTreeMap<String, FileInfo>, Error> {
        let mut entries = BTreeMap::new();

        for entry in walkdir::WalkDir::new(path).min_depth(1).follow_links(false) {
            let entry = entry.map_err(|err| format_err!("walk {:?} failed - {}", path, err))?;

            let relative = entry
                .path()
                .strip_prefix(path)
                .map_err(|err| format_err!("walk {:?} failed - {}", path, err))?
                .to_string_lossy()
                .into_owned();

            let metadata = entry
                .metadata()
                .map_err(|err| format_err!("stat {:?} failed - {}", entry.path(), err))?;

            let link_destination = if metadata.file_type().is_symlink() {
                let target = std::fs::read_link(entry.path())
                    .map_err(|err| format_err!("readlink {:?} failed - {}", entry.path(), err))?;
                Some(target.to_string_lossy().into_owned())
            } else {
                None
            };

            entries.insert(relative, Self::file_info(&metadata, link_destination)?);
        }

        Ok(entries)
    }

    fn copy(&self, src: &Path, dst: &Path, options: &CopyOptions) -> Result<Option<u64>, Error> {
        let src_file = match File::open(src) {
            Ok(file) => file,
            Err(ref err) if err.kind() == ErrorKind::NotFound && options.ignore_missing => {
                return Ok(None);
            }
            Err(err) => bail!("open {:?} failed - {}", src, err),
        };

        if options.create_dirs {
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| format_err!("mkdir {:?} failed - {}", parent, err))?;
            }
        }

        let mut dst_file = File::create(dst)
            .map_err(|err| format_err!("create {:?} failed - {}", dst, err))?;

        let result = match (options.source_compressed, options.compress) {
            (false, true) => {
                zstd::stream::copy_encode(src_file, &mut dst_file, COMPRESS_LEVEL)
                    .map_err(|err| format_err!("compress {:?} failed - {}", src, err))
            }
            (true, false) => {
                zstd::stream::copy_decode(src_file, &mut dst_file)
                    .map_err(|err| format_err!("decompress {:?} failed - {}", src, err))
            }
            _ => {
                let mut src_file = src_file;
                std::io::copy(&mut src_file, &mut dst_file)
                    .map(|_| ())
                    .map_err(|err| format_err!("copy {:?} failed - {}", src, err))
            }
        };
        result?;

        drop(dst_file);

        if let Some(mode) = options.mode {
            std::fs::set_permissions(dst, std::fs::Permissions::from_mode(mode))
                .map_err(|err| format_err!("chmod {:?} failed - {}", dst, err))?;
        }

        if let Some(mtime) = options.modification_time {
            let time = TimeVal::seconds(mtime);
            nix::sys::stat::utimes(dst, &time, &time)
                .map_err(|err| format_err!("utimes {:?} failed - {}", dst, err))?;
        }

        let written = std::fs::metadata(dst)
            .map_err(|err| format_err!("stat {:?} failed - {}", dst, err))?
            .len();

        Ok(Some(written))
    }

    fn hash(&self, path: &Path, compressed: bool) -> Result<String, Error> {
        let file = File::open(path)
            .map_err(|err| format_err!("open {:?} failed - {}", path, err))?;

        if compressed {
            let decoder = zstd::stream::Decoder::new(file)
                .map_err(|err| format_err!("decompress {:?} failed - {}", path, err))?;
            hash_reader(decoder)
        } else {
            hash_reader(file)
        }
    }

    fn link_create(&self, src: &Path, dst: &Path, hard: bool) -> Result<(), Error> {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format_err!("mkdir {:?} failed - {}", parent, err))?;
        }

        match std::fs::remove_file(dst) {
            Ok(()) => {}
            Err(ref err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => bail!("unlink {:?} failed - {}", dst, err),
        }

        if hard {
            std::fs::hard_link(src, dst)
                .map_err(|err| format_err!("hardlink {:?} -> {:?} failed - {}", dst, src, err))?;
        } else {
            std::os::unix::fs::symlink(src, dst)
                .map_err(|err| format_err!("symlink {:?} -> {:?} failed - {}", dst, src, err))?;
        }

        Ok(())
    }

    fn path_create(&self, path: &Path) -> Result<(), Error> {
        std::fs::create_dir_all(path)
            .map_err(|err| format_err!("mkdir {:?} failed - {}", path, err))
    }

    fn path_remove(&self, path: &Path) -> Result<(), Error> {
        match std::fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(ref err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => bail!("remove {:?} failed - {}", path, err),
        }
    }

    fn file_remove(&self, path: &Path) -> Result<(), Error> {
        std::fs::remove_file(path)
            .map_err(|err| format_err!("unlink {:?} failed - {}", path, err))
    }

    fn rename(&self, src: &Path, dst: &Path) -> Result<(), Error> {
        std::fs::rename(src, dst)
            .map_err(|err| format_err!("rename {:?} -> {:?} failed - {}", src, dst, err))
    }
}

/// Resolves the logical roots of a cluster and its backup repository.
#[derive(Clone, Debug)]
pub struct ClusterLayout {
    db: PathBuf,
    repo: PathBuf,
}

impl ClusterLayout {

    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(db: P, repo: Q) -> Self {
        Self { db: db.into(), repo: repo.into() }
    }

    /// Absolute path of the live cluster data directory.
    pub fn db_path(&self) -> &Path {
        &self.db
    }

    /// Absolute path of the backup repository root.
    pub fn repo_path(&self) -> &Path {
        &self.repo
    }

    /// Directory of a published backup.
    pub fn backup_path(&self, label: &str) -> PathBuf {
        self.repo.join(label)
    }

    /// The in-progress backup directory.
    pub fn tmp_path(&self) -> PathBuf {
        self.repo.join(BACKUP_TMP_NAME)
    }

    /// Root of the WAL archive.
    pub fn archive_path(&self) -> PathBuf {
        self.repo.join(ARCHIVE_DIR_NAME)
    }
}
