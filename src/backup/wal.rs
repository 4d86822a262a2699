//! WAL segment naming, range derivation and collection.
//!
//! A segment name is 24 hex characters: timeline, major and minor part,
//! 8 characters each. The archive groups segments into directories named
//! by the 16 character timeline+major prefix.

use anyhow::{format_err, Error};
use lazy_static::lazy_static;
use log::info;
use regex::Regex;

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::BackupOptions;
use crate::error::BackupError;
use crate::fs::{ClusterLayout, CopyOptions, Filesystem, COMPRESS_EXT};
use crate::tools;

use super::builder::DB_PATH_WAL;
use super::manifest::{file_section, Manifest, LEVEL_BASE};

lazy_static! {
    static ref SEGMENT_REGEX: Regex = Regex::new(r"^[0-9A-F]{24}$").unwrap();
    static ref ARCHIVE_MAJOR_REGEX: Regex = Regex::new(r"^[0-9A-F]{16}$").unwrap();
}

/// Regex matching the archive's major directory names.
pub fn archive_major_regex() -> &'static Regex {
    &ARCHIVE_MAJOR_REGEX
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WalSegment {
    pub timeline: u32,
    pub major: u32,
    pub minor: u32,
}

impl WalSegment {

    /// Name of the archive directory holding this segment.
    pub fn major_name(&self) -> String {
        format!("{:08X}{:08X}", self.timeline, self.major)
    }
}

impl std::fmt::Display for WalSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08X}{:08X}{:08X}", self.timeline, self.major, self.minor)
    }
}

impl std::str::FromStr for WalSegment {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        if !SEGMENT_REGEX.is_match(text) {
            return Err(format_err!("invalid WAL segment name '{}'", text));
        }

        Ok(Self {
            timeline: u32::from_str_radix(&text[0..8], 16)?,
            major: u32::from_str_radix(&text[8..16], 16)?,
            minor: u32::from_str_radix(&text[16..24], 16)?,
        })
    }
}

/// Ordered list of segments from `start` to `stop`, both inclusive.
///
/// Database versions before 9.3 never wrote the minor value `FF`;
/// `skip_ff` reproduces that numbering. The minor counter resets at 256
/// (255 with `skip_ff`) before the next emission, so a segment with the
/// reset value never appears in the result.
pub fn range(start: &WalSegment, stop: &WalSegment, skip_ff: bool) -> Result<Vec<WalSegment>, Error> {
    if start.timeline != stop.timeline {
        return Err(BackupError::Assert(format!(
            "timeline switch between segments {} and {}",
            start, stop
        ))
        .into());
    }
    if (start.major, start.minor) > (stop.major, stop.minor) {
        return Err(BackupError::Assert(format!(
            "segment {} lies after segment {}",
            start, stop
        ))
        .into());
    }
    if skip_ff && (start.minor == 0xFF || stop.minor == 0xFF) {
        return Err(BackupError::Assert(format!(
            "segment minor FF cannot occur before version 9.3 ({}..{})",
            start, stop
        ))
        .into());
    }

    let mut segments = Vec::new();
    let mut major = start.major;
    let mut minor = start.minor;

    loop {
        segments.push(WalSegment { timeline: start.timeline, major, minor });

        if major == stop.major && minor == stop.minor {
            break;
        }

        minor += 1;
        if minor == 256 || (skip_ff && minor == 255) {
            major = major
                .checked_add(1)
                .ok_or_else(|| Error::from(BackupError::Assert(
                    "WAL major number overflow".to_string(),
                )))?;
            minor = 0;
        }
    }

    Ok(segments)
}

/// Collect the WAL segments between `start` and `stop` from the archive
/// into the temp backup's `base/pg_xlog`, recording a manifest file
/// entry for each. Returns the number of collected segments.
pub fn collect<F: Filesystem>(
    fs: &F,
    layout: &ClusterLayout,
    manifest: &mut Manifest,
    start: &str,
    stop: &str,
    options: &BackupOptions,
    skip_ff: bool,
) -> Result<u64, Error> {

    let start: WalSegment = start.parse()?;
    let stop: WalSegment = stop.parse()?;
    let segments = range(&start, &stop, skip_ff)?;

    info!("collecting {} WAL segment(s) for backup consistency", segments.len());

    let wal_dir = layout.tmp_path().join(LEVEL_BASE).join(DB_PATH_WAL);
    fs.path_create(&wal_dir)?;

    for segment in &segments {
        let name = segment.to_string();
        let archive_dir = layout.archive_path().join(segment.major_name());

        // the archived file may carry a hash suffix and a compression
        // extension; exactly one match is required
        let filter =
            Regex::new(&format!(r"^{}(-[0-9a-f]+)?(\.{})?$", name, COMPRESS_EXT)).unwrap();
        let found = wait_for_segment(fs, &archive_dir, &filter, options.archive_timeout, &name)?;

        let source_compressed = found.ends_with(&format!(".{}", COMPRESS_EXT));
        let source = archive_dir.join(&found);
        let destination = if options.compress {
            wal_dir.join(format!("{}.{}", name, COMPRESS_EXT))
        } else {
            wal_dir.join(&name)
        };

        fs.copy(
            &source,
            &destination,
            &CopyOptions {
                source_compressed,
                compress: options.compress,
                ignore_missing: false,
                mode: Some(0o600),
                modification_time: None,
                create_dirs: true,
            },
        )?;

        let info = fs.stat(&destination)?;
        let section = file_section(LEVEL_BASE);
        let key = format!("{}/{}", DB_PATH_WAL, name);
        manifest.set_attr(&section, &key, "user", info.user.as_str());
        manifest.set_attr(&section, &key, "group", info.group.as_str());
        manifest.set_attr(&section, &key, "permission", tools::mode_to_octal(info.permission));
        manifest.set_attr(&section, &key, "size", info.size);
        manifest.set_attr(&section, &key, "modification_time", info.modification_time);
        if options.checksum {
            let digest = fs.hash(&destination, options.compress)?;
            manifest.set_attr(&section, &key, "checksum", digest.as_str());
        }
    }

    Ok(segments.len() as u64)
}

fn wait_for_segment<F: Filesystem>(
    fs: &F,
    archive_dir: &Path,
    filter: &Regex,
    timeout: Duration,
    name: &str,
) -> Result<String, Error> {

    let deadline = Instant::now() + timeout;

    loop {
        let mut matches = fs.list(archive_dir, filter)?;
        match matches.len() {
            0 => {}
            1 => return Ok(matches.remove(0)),
            _ => {
                return Err(BackupError::Protocol(format!(
                    "duplicate files for WAL segment {} in {:?}: {}",
                    name,
                    archive_dir,
                    matches.join(", ")
                ))
                .into());
            }
        }

        if Instant::now() >= deadline {
            return Err(BackupError::Protocol(format!(
                "WAL segment {} did not reach the archive within {} seconds",
                name,
                timeout.as_secs()
            ))
            .into());
        }

        thread::sleep(Duration::from_secs(1));
    }
}
