//! Typed error kinds for the backup engine.
//!
//! Most call sites propagate `anyhow::Error`. The kinds below are attached
//! at the raise site whenever a caller (or a test) needs to distinguish the
//! failure class, and can be recovered with `Error::downcast_ref`.

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum BackupError {
    #[error("checksum error: {0}")]
    Checksum(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid parameter: {0}")]
    Param(String),

    #[error("path {0:?} is not empty")]
    PathNotEmpty(PathBuf),

    #[error("postmaster.pid exists - is the cluster still running?")]
    PostmasterRunning,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("malformed manifest: {0}")]
    MalformedManifest(String),

    #[error("assertion failed: {0}")]
    Assert(String),
}
