//! Backup manifest model and store.
//!
//! A manifest is a mapping from section name to key to either a scalar
//! or a map of attributes, all with typed leaf values. On disk it is a
//! sectioned text file with one `key=value` line per entry, where the
//! value is the JSON serialization of the scalar or attribute map. The
//! in-memory model does not leak the on-disk serialization; values
//! round-trip exactly and unknown sections and keys are preserved.

use anyhow::Error;
use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::BackupError;
use crate::tools;

/// Manifest file name inside a backup directory.
pub const MANIFEST_NAME: &str = "backup.manifest";

pub const SECTION_BACKUP: &str = "backup";
pub const SECTION_BACKUP_OPTION: &str = "backup:option";
pub const SECTION_BACKUP_PATH: &str = "backup:path";
pub const SECTION_BACKUP_TABLESPACE: &str = "backup:tablespace";

/// The default level of a cluster walk; tablespaces form their own levels.
pub const LEVEL_BASE: &str = "base";

pub fn tablespace_level(name: &str) -> String {
    format!("tablespace:{}", name)
}

pub fn file_section(level: &str) -> String {
    format!("{}:file", level)
}

pub fn path_section(level: &str) -> String {
    format!("{}:path", level)
}

pub fn link_section(level: &str) -> String {
    format!("{}:link", level)
}

/// A typed leaf value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Integer(i64),
    Text(String),
}

impl Value {

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Integer(value as i64)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

pub type Attrs = BTreeMap<String, Value>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Entry {
    Scalar(Value),
    Attrs(Attrs),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Manifest {
    sections: BTreeMap<String, BTreeMap<String, Entry>>,
}

impl Manifest {

    pub fn new() -> Self {
        Self { sections: BTreeMap::new() }
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            Error::from(BackupError::MalformedManifest(
                format!("unable to read {:?} - {}", path, err),
            ))
        })?;
        Self::parse(&text)
    }

    /// Atomically (re)write the manifest at `path`.
    pub fn save(&self, path: &Path) -> Result<(), Error> {
        tools::replace_file(path, self.render().as_bytes(), None)
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut sections: BTreeMap<String, BTreeMap<String, Entry>> = BTreeMap::new();
        let mut current: Option<String> = None;

        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with('[') {
                if !line.ends_with(']') || line.len() < 3 {
                    return Err(malformed(number, "invalid section header"));
                }
                let name = line[1..line.len() - 1].to_string();
                sections.entry(name.clone()).or_default();
                current = Some(name);
                continue;
            }

            let section = match current {
                Some(ref name) => name.clone(),
                None => return Err(malformed(number, "entry before first section header")),
            };

            let (key, value) = match line.find('=') {
                Some(pos) => (&line[..pos], &line[pos + 1..]),
                None => return Err(malformed(number, "entry without '='")),
            };

            let entry: Entry = serde_json::from_str(value)
                .map_err(|err| malformed(number, &format!("invalid value - {}", err)))?;

            sections.get_mut(&section).unwrap().insert(key.to_string(), entry);
        }

        Ok(Self { sections })
    }

    pub fn render(&self) -> String {
        let mut text = String::new();

        for (name, entries) in &self.sections {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&format!("[{}]\n", name));
            for (key, entry) in entries {
                // Entry serialization cannot fail: values are plain scalars
                let value = serde_json::to_string(entry).unwrap();
                text.push_str(&format!("{}={}\n", key, value));
            }
        }

        text
    }

    pub fn set_scalar<V: Into<Value>>(&mut self, section: &str, key: &str, value: V) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), Entry::Scalar(value.into()));
    }

    pub fn scalar(&self, section: &str, key: &str) -> Option<&Value> {
        match self.sections.get(section)?.get(key)? {
            Entry::Scalar(value) => Some(value),
            Entry::Attrs(_) => None,
        }
    }

    pub fn scalar_str(&self, section: &str, key: &str) -> Option<&str> {
        self.scalar(section, key)?.as_str()
    }

    pub fn scalar_integer(&self, section: &str, key: &str) -> Option<i64> {
        self.scalar(section, key)?.as_integer()
    }

    pub fn scalar_bool(&self, section: &str, key: &str) -> Option<bool> {
        self.scalar(section, key)?.as_bool()
    }

    pub fn set_attr<V: Into<Value>>(&mut self, section: &str, key: &str, attr: &str, value: V) {
        let entry = self
            .sections
            .entry(section.to_string())
            .or_default()
            .entry(key.to_string())
            .or_insert_with(|| Entry::Attrs(Attrs::new()));

        match entry {
            Entry::Attrs(attrs) => {
                attrs.insert(attr.to_string(), value.into());
            }
            Entry::Scalar(_) => {
                let mut attrs = Attrs::new();
                attrs.insert(attr.to_string(), value.into());
                *entry = Entry::Attrs(attrs);
            }
        }
    }

    pub fn entry(&self, section: &str, key: &str) -> Option<&Attrs> {
        match self.sections.get(section)?.get(key)? {
            Entry::Attrs(attrs) => Some(attrs),
            Entry::Scalar(_) => None,
        }
    }

    pub fn attr(&self, section: &str, key: &str, attr: &str) -> Option<&Value> {
        self.entry(section, key)?.get(attr)
    }

    pub fn attr_str(&self, section: &str, key: &str, attr: &str) -> Option<&str> {
        self.attr(section, key, attr)?.as_str()
    }

    pub fn attr_integer(&self, section: &str, key: &str, attr: &str) -> Option<i64> {
        self.attr(section, key, attr)?.as_integer()
    }

    pub fn has_entry(&self, section: &str, key: &str) -> bool {
        self.entry(section, key).is_some()
    }

    pub fn remove_key(&mut self, section: &str, key: &str) -> bool {
        match self.sections.get_mut(section) {
            Some(entries) => entries.remove(key).is_some(),
            None => false,
        }
    }

    /// All section names, sorted.
    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(|name| name.as_str())
    }

    /// Attribute entries of one section, sorted by key.
    pub fn entries<'a>(&'a self, section: &str) -> impl Iterator<Item = (&'a str, &'a Attrs)> {
        self.sections
            .get(section)
            .into_iter()
            .flat_map(|entries| entries.iter())
            .filter_map(|(key, entry)| match entry {
                Entry::Attrs(attrs) => Some((key.as_str(), attrs)),
                Entry::Scalar(_) => None,
            })
    }
}

fn malformed(line_number: usize, reason: &str) -> Error {
    Error::from(BackupError::MalformedManifest(
        format!("line {}: {}", line_number + 1, reason),
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> Manifest {
        let mut manifest = Manifest::new();
        manifest.set_scalar(SECTION_BACKUP, "label", "20240315-083000F");
        manifest.set_scalar(SECTION_BACKUP, "timestamp-start", 1710491400i64);
        manifest.set_scalar(SECTION_BACKUP_OPTION, "compress", false);
        manifest.set_attr("base:file", "global/pg_control", "size", 8192u64);
        manifest.set_attr("base:file", "global/pg_control", "user", "postgres");
        manifest
    }

    #[test]
    fn test_roundtrip() {
        let manifest = sample();
        let parsed = Manifest::parse(&manifest.render()).unwrap();
        assert_eq!(manifest, parsed);

        assert_eq!(parsed.scalar_str(SECTION_BACKUP, "label"), Some("20240315-083000F"));
        assert_eq!(parsed.scalar_integer(SECTION_BACKUP, "timestamp-start"), Some(1710491400));
        assert_eq!(parsed.scalar_bool(SECTION_BACKUP_OPTION, "compress"), Some(false));
        assert_eq!(parsed.attr_integer("base:file", "global/pg_control", "size"), Some(8192));
        assert_eq!(
            parsed.attr_str("base:file", "global/pg_control", "user"),
            Some("postgres")
        );
    }

    #[test]
    fn test_unknown_sections_preserved() {
        let text = "[future:section]\nsome/key={\"whatever\":42}\n";
        let parsed = Manifest::parse(text).unwrap();
        let rendered = parsed.render();
        assert!(rendered.contains("[future:section]"));
        assert!(rendered.contains("some/key={\"whatever\":42}"));
    }

    #[test]
    fn test_malformed() {
        use crate::error::BackupError;

        for text in &[
            "key=1\n",                       // entry before any section
            "[backup]\nnoequals\n",          // entry without '='
            "[backup]\nkey={broken\n",       // invalid value
            "[backup\nkey=1\n",              // unterminated header
        ] {
            let err = Manifest::parse(text).unwrap_err();
            assert!(
                err.downcast_ref::<BackupError>()
                    .map(|err| matches!(err, BackupError::MalformedManifest(_)))
                    .unwrap_or(false),
                "expected MalformedManifest for {:?}",
                text
            );
        }
    }

    #[test]
    fn test_remove_key() {
        let mut manifest = sample();
        assert!(manifest.remove_key("base:file", "global/pg_control"));
        assert!(!manifest.remove_key("base:file", "global/pg_control"));
        assert!(!manifest.has_entry("base:file", "global/pg_control"));
    }

    #[test]
    fn test_entries_iteration() {
        let mut manifest = sample();
        manifest.set_attr("base:file", "base/1/2", "size", 1u64);
        let keys: Vec<&str> = manifest.entries("base:file").map(|(key, _)| key).collect();
        assert_eq!(keys, vec!["base/1/2", "global/pg_control"]);
    }
}
