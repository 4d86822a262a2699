//! Backup labels.
//!
//! A full backup is labelled `YYYYMMDD-HHMMSSF`. Backups derived from it
//! carry the full label as prefix: `YYYYMMDD-HHMMSSF_YYYYMMDD-HHMMSSD`
//! for a differential, `..I` for an incremental. Lexicographic order of
//! labels therefore agrees with chronological order within one full
//! backup chain, and the first 16 characters of any derived label name
//! its ancestor full backup.

use anyhow::{bail, format_err, Error};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;

use std::path::Path;

use crate::fs::Filesystem;

macro_rules! LABEL_DATE_RE { () => (r"[0-9]{8}-[0-9]{6}") }

lazy_static! {
    static ref FULL_LABEL_REGEX: Regex = Regex::new(
        concat!(r"^", LABEL_DATE_RE!(), r"F$")).unwrap();

    static ref DIFF_LABEL_REGEX: Regex = Regex::new(
        concat!(r"^", LABEL_DATE_RE!(), r"F_", LABEL_DATE_RE!(), r"D$")).unwrap();

    static ref INCR_LABEL_REGEX: Regex = Regex::new(
        concat!(r"^", LABEL_DATE_RE!(), r"F_", LABEL_DATE_RE!(), r"I$")).unwrap();
}

/// Length of a full backup label; also the ancestor prefix length of a
/// derived label.
pub const FULL_LABEL_LEN: usize = 16;

const LABEL_TIME_FORMAT: &str = "%Y%m%d-%H%M%S";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackupType {
    Full,
    Diff,
    Incr,
}

impl BackupType {

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Diff => "diff",
            BackupType::Incr => "incr",
        }
    }
}

impl std::fmt::Display for BackupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BackupType {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text {
            "full" => Ok(BackupType::Full),
            "diff" => Ok(BackupType::Diff),
            "incr" => Ok(BackupType::Incr),
            _ => bail!("invalid backup type '{}'", text),
        }
    }
}

/// Build an anchored regex matching labels of the requested kinds.
///
/// At least one kind must be requested.
pub fn label_regex(full: bool, diff: bool, incr: bool) -> Regex {
    assert!(full || diff || incr, "label_regex needs at least one backup type");

    let mut kinds = Vec::new();
    if full {
        kinds.push(concat!(LABEL_DATE_RE!(), "F").to_string());
    }
    if diff {
        kinds.push(format!("{}F_{}D", LABEL_DATE_RE!(), LABEL_DATE_RE!()));
    }
    if incr {
        kinds.push(format!("{}F_{}I", LABEL_DATE_RE!(), LABEL_DATE_RE!()));
    }

    Regex::new(&format!("^(?:{})$", kinds.join("|"))).unwrap()
}

/// Determine the type a label encodes.
pub fn label_type(label: &str) -> Result<BackupType, Error> {
    if FULL_LABEL_REGEX.is_match(label) {
        Ok(BackupType::Full)
    } else if DIFF_LABEL_REGEX.is_match(label) {
        Ok(BackupType::Diff)
    } else if INCR_LABEL_REGEX.is_match(label) {
        Ok(BackupType::Incr)
    } else {
        bail!("invalid backup label '{}'", label)
    }
}

/// Label of the ancestor full backup (the label itself for a full).
pub fn ancestor_full(label: &str) -> &str {
    &label[..FULL_LABEL_LEN]
}

/// Compose a new label.
///
/// Derived types need the prior backup's label to inherit the ancestor
/// full prefix from.
pub fn new_label(prior: Option<&str>, backup_type: BackupType, now: DateTime<Utc>) -> Result<String, Error> {
    let stamp = now.format(LABEL_TIME_FORMAT);

    match backup_type {
        BackupType::Full => Ok(format!("{}F", stamp)),
        BackupType::Diff | BackupType::Incr => {
            let prior = prior.ok_or_else(|| {
                format_err!("cannot compose a {} label without a prior backup", backup_type)
            })?;
            let suffix = if backup_type == BackupType::Diff { 'D' } else { 'I' };
            Ok(format!("{}_{}{}", ancestor_full(prior), stamp, suffix))
        }
    }
}

/// Find the backup a new backup of `backup_type` should derive from.
///
/// An incremental derives from the most recent backup of any type. A
/// differential (or full) falls back to the most recent full backup.
/// The caller decides what to do when nothing is found.
pub fn find_prior<F: Filesystem>(
    fs: &F,
    repo_path: &Path,
    backup_type: BackupType,
) -> Result<Option<String>, Error> {

    if backup_type == BackupType::Incr {
        if let Some(label) = last_matching(fs, repo_path, &label_regex(true, true, true))? {
            return Ok(Some(label));
        }
    }

    last_matching(fs, repo_path, &label_regex(true, false, false))
}

fn last_matching<F: Filesystem>(
    fs: &F,
    repo_path: &Path,
    filter: &Regex,
) -> Result<Option<String>, Error> {
    // list() sorts ascending; reverse lexicographic equals reverse
    // chronological within a chain
    let names = fs.list(repo_path, filter)?;
    Ok(names.into_iter().last())
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_label_grammar() {
        let now = Utc.ymd(2024, 3, 15).and_hms(8, 30, 0);
        let full = new_label(None, BackupType::Full, now).unwrap();
        assert_eq!(full, "20240315-083000F");
        assert_eq!(full.len(), FULL_LABEL_LEN);

        let later = Utc.ymd(2024, 3, 16).and_hms(8, 30, 0);
        let incr = new_label(Some(&full), BackupType::Incr, later).unwrap();
        assert_eq!(incr, "20240315-083000F_20240316-083000I");
        assert_eq!(ancestor_full(&incr), full);

        let diff = new_label(Some(&incr), BackupType::Diff, later).unwrap();
        assert_eq!(ancestor_full(&diff), full);

        assert!(new_label(None, BackupType::Incr, now).is_err());
    }

    #[test]
    fn test_label_type() {
        assert_eq!(label_type("20240315-083000F").unwrap(), BackupType::Full);
        assert_eq!(
            label_type("20240315-083000F_20240316-083000D").unwrap(),
            BackupType::Diff
        );
        assert_eq!(
            label_type("20240315-083000F_20240316-083000I").unwrap(),
            BackupType::Incr
        );
        assert!(label_type("garbage").is_err());
        assert!(label_type("20240315-083000X").is_err());
    }

    #[test]
    fn test_label_regex() {
        let full_only = label_regex(true, false, false);
        assert!(full_only.is_match("20240315-083000F"));
        assert!(!full_only.is_match("20240315-083000F_20240316-083000I"));

        let derived = label_regex(false, true, true);
        assert!(!derived.is_match("20240315-083000F"));
        assert!(derived.is_match("20240315-083000F_20240316-083000D"));
        assert!(derived.is_match("20240315-083000F_20240316-083000I"));

        // no partial matches
        assert!(!label_regex(true, true, true).is_match("x20240315-083000F"));
    }

    #[test]
    fn test_label_ordering() {
        // lexicographic order within a chain is chronological order
        let labels = [
            "20240315-083000F",
            "20240315-083000F_20240316-083000I",
            "20240315-083000F_20240317-083000D",
        ];
        let mut sorted = labels.to_vec();
        sorted.sort();
        assert_eq!(sorted, labels);
    }
}
