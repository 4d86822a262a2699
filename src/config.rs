//! Backup and retention option sets.

use anyhow::Error;

use std::time::Duration;

use crate::backup::BackupType;
use crate::error::BackupError;

/// Default wait for an expected WAL segment to show up in the archive.
pub const DEFAULT_ARCHIVE_TIMEOUT: Duration = Duration::from_secs(600);

/// Options controlling a single backup run.
#[derive(Clone, Debug)]
pub struct BackupOptions {
    pub backup_type: BackupType,
    pub compress: bool,
    pub checksum: bool,
    pub hardlink: bool,
    pub online: bool,
    pub start_fast: bool,
    pub resume: bool,
    pub process_max: usize,
    pub copy_timeout: Option<Duration>,
    pub archive_timeout: Duration,
}

impl BackupOptions {

    pub fn new(backup_type: BackupType) -> Self {
        Self {
            backup_type,
            compress: false,
            checksum: true,
            hardlink: false,
            online: true,
            start_fast: false,
            resume: true,
            process_max: 1,
            copy_timeout: None,
            archive_timeout: DEFAULT_ARCHIVE_TIMEOUT,
        }
    }

    pub fn compress(mut self, value: bool) -> Self {
        self.compress = value;
        self
    }

    pub fn checksum(mut self, value: bool) -> Self {
        self.checksum = value;
        self
    }

    pub fn hardlink(mut self, value: bool) -> Self {
        self.hardlink = value;
        self
    }

    pub fn online(mut self, value: bool) -> Self {
        self.online = value;
        self
    }

    pub fn start_fast(mut self, value: bool) -> Self {
        self.start_fast = value;
        self
    }

    pub fn resume(mut self, value: bool) -> Self {
        self.resume = value;
        self
    }

    pub fn process_max(mut self, value: usize) -> Self {
        self.process_max = value;
        self
    }

    pub fn copy_timeout(mut self, value: Option<Duration>) -> Self {
        self.copy_timeout = value;
        self
    }

    pub fn archive_timeout(mut self, value: Duration) -> Self {
        self.archive_timeout = value;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.process_max < 1 {
            return Err(BackupError::Param("process-max must be at least 1".to_string()).into());
        }
        Ok(())
    }
}

/// Options controlling backup and WAL archive retention.
#[derive(Clone, Debug)]
pub struct RetentionOptions {
    pub retention_full: Option<u64>,
    pub retention_diff: Option<u64>,
    pub retention_archive_type: Option<BackupType>,
    pub retention_archive: Option<u64>,
}

impl RetentionOptions {

    pub fn new() -> Self {
        Self {
            retention_full: None,
            retention_diff: None,
            retention_archive_type: None,
            retention_archive: None,
        }
    }

    pub fn retention_full(mut self, value: Option<u64>) -> Self {
        self.retention_full = value;
        self
    }

    pub fn retention_diff(mut self, value: Option<u64>) -> Self {
        self.retention_diff = value;
        self
    }

    pub fn retention_archive(mut self, backup_type: Option<BackupType>, value: Option<u64>) -> Self {
        self.retention_archive_type = backup_type;
        self.retention_archive = value;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        for (name, value) in &[
            ("retention-full", self.retention_full),
            ("retention-diff", self.retention_diff),
            ("retention-archive", self.retention_archive),
        ] {
            if let Some(value) = value {
                if *value < 1 {
                    return Err(BackupError::Param(
                        format!("{} must be at least 1 (got {})", name, value),
                    ).into());
                }
            }
        }

        if self.retention_archive.is_some() != self.retention_archive_type.is_some() {
            return Err(BackupError::Config(
                "retention-archive and retention-archive-type must be set together".to_string(),
            ).into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_retention_validation() {
        assert!(RetentionOptions::new().validate().is_ok());
        assert!(RetentionOptions::new().retention_full(Some(1)).validate().is_ok());
        assert!(RetentionOptions::new().retention_full(Some(0)).validate().is_err());
        assert!(RetentionOptions::new()
            .retention_archive(Some(BackupType::Full), None)
            .validate()
            .is_err());
        assert!(RetentionOptions::new()
            .retention_archive(Some(BackupType::Full), Some(2))
            .validate()
            .is_ok());
    }
}
