//! Small helpers used across the crate.

use anyhow::{bail, format_err, Error};

use std::fs::File;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Atomically replace the contents of `path` with `data`.
///
/// The data goes to a process-unique sibling file first and is moved
/// into place, so a crashed writer never leaves a half written file
/// under the final name. Re-replacing an existing path is fine.
pub fn replace_file<P: AsRef<Path>>(
    path: P,
    data: &[u8],
    mode: Option<u32>,
) -> Result<(), Error> {

    let path = path.as_ref();

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| format_err!("invalid file name {:?}", path))?;
    let dir = path.parent()
        .ok_or_else(|| format_err!("path {:?} has no parent directory", path))?;

    // one writer per process is enough here: the temp backup tree has a
    // single coordinator, and repository files are never written by two
    // backup invocations at once
    let staging = dir.join(format!(".{}.{}", file_name, std::process::id()));

    let write = || -> Result<(), Error> {
        let mut file = File::create(&staging)
            .map_err(|err| format_err!("create {:?} failed - {}", staging, err))?;
        file.write_all(data)
            .map_err(|err| format_err!("write {:?} failed - {}", staging, err))?;
        file.sync_all()
            .map_err(|err| format_err!("fsync {:?} failed - {}", staging, err))?;
        std::fs::set_permissions(
            &staging,
            std::fs::Permissions::from_mode(mode.unwrap_or(0o644)),
        )
        .map_err(|err| format_err!("chmod {:?} failed - {}", staging, err))?;
        std::fs::rename(&staging, path)
            .map_err(|err| format_err!("rename {:?} -> {:?} failed - {}", staging, path, err))?;
        Ok(())
    };

    if let Err(err) = write() {
        let _ = std::fs::remove_file(&staging);
        return Err(err);
    }

    Ok(())
}

/// Render a binary digest as lowercase hex.
pub fn digest_to_hex(digest: &[u8]) -> String {
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

/// Parse an octal permission string like `0600`.
pub fn mode_from_octal(text: &str) -> Result<u32, Error> {
    match u32::from_str_radix(text, 8) {
        Ok(mode) => Ok(mode),
        Err(err) => bail!("invalid permission string '{}' - {}", text, err),
    }
}

/// Render a permission mode as a 4-digit octal string.
pub fn mode_to_octal(mode: u32) -> String {
    format!("{:04o}", mode & 0o7777)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_replace_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target.txt");

        replace_file(&path, b"first", None).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"first");

        // replacing an existing file works and leaves no staging file
        replace_file(&path, b"second", Some(0o600)).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_digest_to_hex() {
        assert_eq!(digest_to_hex(&[0u8, 255u8, 16u8]), "00ff10");
    }

    #[test]
    fn test_mode_roundtrip() {
        assert_eq!(mode_to_octal(0o600), "0600");
        assert_eq!(mode_from_octal("0600").unwrap(), 0o600);
        assert_eq!(mode_from_octal("755").unwrap(), 0o755);
        assert!(mode_from_octal("9x").is_err());
    }
}
