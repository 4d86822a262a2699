//! This module implements the backup engine.
//!
//! # Backups
//!
//! A backup is a directory tree named by its label, holding an exact
//! byte level copy of the cluster (`base/**`, `tablespace/<NAME>/**`),
//! the WAL segments needed to make it self consistent
//! (`base/pg_xlog/`), a `version` file and a `backup.manifest`.
//!
//! The manifest declares the backup's complete contents and its
//! relationship to prior backups: a file whose size, inode and
//! modification time are unchanged since the prior backup is not copied
//! again, it gets a `reference` to the backup that still holds its
//! bytes (and optionally a hard link, so the file shows up in this
//! backup's tree without new bytes on disk).
//!
//! # Engine phases
//!
//! * label selection and prior backup discovery (`label`)
//! * manifest construction against the prior manifest (`builder`)
//! * resume analysis of an aborted `backup.tmp` (`resume`)
//! * copy classification (`plan`) and parallel execution (`executor`)
//! * WAL range derivation and collection (`wal`)
//! * retention over backups and the WAL archive (`prune`)
//!
//! The `engine` module runs these in order. Publishing a backup is a
//! single atomic rename of `backup.tmp` to the final label; retention
//! only ever touches published backups.

mod label;
pub use label::*;

mod manifest;
pub use manifest::*;

mod builder;
pub use builder::*;

mod resume;
pub use resume::*;

mod plan;
pub use plan::*;

mod executor;
pub use executor::*;

mod wal;
pub use wal::*;

mod prune;
pub use prune::*;

mod engine;
pub use engine::*;
