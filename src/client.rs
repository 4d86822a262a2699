//! Database control client interface.
//!
//! The engine never talks to the cluster itself. A [DbClient]
//! implementation (libpq based in production, scripted in tests) issues
//! the backup bracketing calls and answers catalog queries.

use anyhow::Error;

use std::collections::BTreeMap;

pub trait DbClient {
    /// Put the cluster into backup mode. Returns the WAL segment name
    /// (24 hex characters) holding the backup start position.
    fn backup_start(&mut self, label: &str, fast: bool) -> Result<String, Error>;

    /// Take the cluster out of backup mode. Returns the WAL segment name
    /// holding the backup stop position.
    fn backup_stop(&mut self) -> Result<String, Error>;

    /// Map of tablespace oid to tablespace name.
    fn tablespace_map(&mut self) -> Result<BTreeMap<String, String>, Error>;

    /// Numeric server version, e.g. `90401` for 9.4.1.
    fn db_version(&mut self) -> Result<u32, Error>;
}

/// First server version that writes the `FF` WAL minor value. Older
/// versions skip it when stepping through segment names.
pub const VERSION_WAL_FF: u32 = 90300;
