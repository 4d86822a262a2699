//! Backup coordinator.
//!
//! Runs one backup from type resolution to the final atomic rename. The
//! rename of `backup.tmp` to the backup label is the linearization
//! point: no partial state is ever observable under another name, and a
//! fatal error leaves the temp directory behind for a later resume.

use anyhow::Error;
use chrono::{DateTime, Utc};
use log::{info, warn};

use std::collections::BTreeMap;

use crate::client::{DbClient, VERSION_WAL_FF};
use crate::config::BackupOptions;
use crate::error::BackupError;
use crate::fs::{ClusterLayout, Filesystem};
use crate::tools;

use super::builder::{build_manifest, DB_FILE_POSTMASTER_PID};
use super::executor;
use super::label::{self, label_regex, BackupType};
use super::manifest::{Manifest, MANIFEST_NAME, SECTION_BACKUP, SECTION_BACKUP_OPTION};
use super::plan;
use super::resume::{self, VERSION_NAME};
use super::wal;

/// Backup format version, recorded in the manifest and the `version`
/// file of every backup. Resume refuses temp trees of another version.
pub const FORMAT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug)]
pub struct BackupSummary {
    pub label: String,
    pub backup_type: BackupType,
    pub copied: u64,
    pub copied_bytes: u64,
    pub referenced: u64,
    pub linked: u64,
    pub removed: u64,
    pub wal_segments: u64,
    pub archive_start: Option<String>,
    pub archive_stop: Option<String>,
}

pub struct BackupEngine<F, C> {
    fs: F,
    client: C,
    layout: ClusterLayout,
    options: BackupOptions,
}

impl<F, C> BackupEngine<F, C>
where
    F: Filesystem + Clone + 'static,
    C: DbClient,
{
    pub fn new(fs: F, client: C, layout: ClusterLayout, options: BackupOptions) -> Self {
        Self { fs, client, layout, options }
    }

    pub fn run(&mut self, now: DateTime<Utc>) -> Result<BackupSummary, Error> {
        self.options.validate()?;

        if !self.options.online
            && self.fs.exists(&self.layout.db_path().join(DB_FILE_POSTMASTER_PID))?
        {
            return Err(BackupError::PostmasterRunning.into());
        }

        self.fs.path_create(self.layout.repo_path())?;

        // a derived backup needs a full backup to derive from
        let mut backup_type = self.options.backup_type;
        if backup_type != BackupType::Full {
            let fulls = self.fs.list(self.layout.repo_path(), &label_regex(true, false, false))?;
            if fulls.is_empty() {
                warn!(
                    "no full backup exists yet, {} backup coerced to full",
                    backup_type
                );
                backup_type = BackupType::Full;
            }
        }

        let prior_label = if backup_type == BackupType::Full {
            None
        } else {
            label::find_prior(&self.fs, self.layout.repo_path(), backup_type)?
        };

        let prior_manifest = match prior_label {
            Some(ref prior) => Some(Manifest::load(
                &self.layout.backup_path(prior).join(MANIFEST_NAME),
            )?),
            None => None,
        };

        let label = label::new_label(prior_label.as_deref(), backup_type, now)?;
        let backup_path = self.layout.backup_path(&label);
        if self.fs.exists(&backup_path)? {
            return Err(BackupError::PathNotEmpty(backup_path).into());
        }

        match prior_label {
            Some(ref prior) => info!("start {} backup {} (prior {})", backup_type, label, prior),
            None => info!("start {} backup {}", backup_type, label),
        }

        let mut manifest = Manifest::new();
        manifest.set_scalar(SECTION_BACKUP, "label", label.as_str());
        manifest.set_scalar(SECTION_BACKUP, "type", backup_type.as_str());
        if let Some(ref prior) = prior_label {
            manifest.set_scalar(SECTION_BACKUP, "prior", prior.as_str());
        }
        manifest.set_scalar(SECTION_BACKUP, "version", FORMAT_VERSION);
        manifest.set_scalar(SECTION_BACKUP, "timestamp-start", now.timestamp());
        manifest.set_scalar(SECTION_BACKUP_OPTION, "compress", self.options.compress);
        manifest.set_scalar(SECTION_BACKUP_OPTION, "checksum", self.options.checksum);
        manifest.set_scalar(SECTION_BACKUP_OPTION, "hardlink", self.options.hardlink);

        let tablespace_map = if self.options.online {
            self.client.tablespace_map()?
        } else {
            BTreeMap::new()
        };

        build_manifest(
            &self.fs,
            &mut manifest,
            prior_manifest.as_ref(),
            self.layout.db_path(),
            &tablespace_map,
        )?;

        let resume_state =
            resume::analyze(&self.fs, &self.layout, &manifest, self.options.resume)?;

        let tmp_path = self.layout.tmp_path();

        // persist early so an aborted copy phase can be resumed
        tools::replace_file(
            &tmp_path.join(VERSION_NAME),
            format!("{}\n", FORMAT_VERSION).as_bytes(),
            None,
        )?;
        manifest.save(&tmp_path.join(MANIFEST_NAME))?;

        let mut archive_start = None;
        if self.options.online {
            let position = self.client.backup_start(&label, self.options.start_fast)?;
            info!("backup started at WAL segment {}", position);
            manifest.set_scalar(SECTION_BACKUP, "archive-start", position.as_str());
            archive_start = Some(position);
        }

        let plan = plan::build_plan(
            &self.fs,
            &self.layout,
            &manifest,
            &resume_state,
            &self.options,
        )?;
        let copy_stats = executor::execute(&self.fs, &mut manifest, plan.jobs, &self.options)?;

        let mut archive_stop = None;
        if self.options.online {
            let position = self.client.backup_stop()?;
            info!("backup stopped at WAL segment {}", position);
            manifest.set_scalar(SECTION_BACKUP, "archive-stop", position.as_str());
            archive_stop = Some(position);
        }
        manifest.set_scalar(SECTION_BACKUP, "timestamp-stop", Utc::now().timestamp());

        // manifest hits the disk before WAL collection starts
        manifest.save(&tmp_path.join(MANIFEST_NAME))?;

        let mut wal_segments = 0;
        if let (Some(start), Some(stop)) = (&archive_start, &archive_stop) {
            let skip_ff = self.client.db_version()? < VERSION_WAL_FF;
            wal_segments = wal::collect(
                &self.fs,
                &self.layout,
                &mut manifest,
                start,
                stop,
                &self.options,
                skip_ff,
            )?;
        }

        manifest.save(&tmp_path.join(MANIFEST_NAME))?;

        self.fs.rename(&tmp_path, &backup_path)?;
        info!(
            "backup {} complete: {} file(s) copied ({} bytes), {} referenced, {} linked",
            label, copy_stats.copied, copy_stats.copied_bytes, plan.referenced, plan.linked
        );

        Ok(BackupSummary {
            label,
            backup_type,
            copied: copy_stats.copied,
            copied_bytes: copy_stats.copied_bytes,
            referenced: plan.referenced,
            linked: plan.linked,
            removed: copy_stats.removed,
            wal_segments,
            archive_start,
            archive_stop,
        })
    }
}
