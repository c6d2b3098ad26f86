//! Minimal INI key-value store.
//!
//! Policy, descriptor, and selection-index files all share this format:
//!
//! ```text
//! [Section Name]
//! Key = Value
//! Quoted = "value with spaces"
//! ```
//!
//! Sections and keys keep insertion order so saved files diff cleanly.
//! Values wrapped in double quotes are unquoted on read.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Errors raised while reading or writing a store file.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{path}:{line}: expected `key = value` or `[section]`, found {text:?}")]
    Syntax {
        path: PathBuf,
        line: usize,
        text: String,
    },

    #[error("Key {key:?} missing from section [{section}]")]
    MissingKey { section: String, key: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Section {
    name: String,
    entries: Vec<(String, String)>,
}

/// Ordered collection of `[section]` → `key = value` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IniStore {
    sections: Vec<Section>,
}

impl IniStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a store from disk.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let text = fs::read_to_string(path).map_err(|source| StoreError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    /// Parse store text. `origin` is only used in error messages.
    pub fn parse(text: &str, origin: &Path) -> Result<Self, StoreError> {
        let mut store = Self::new();
        let mut current: Option<String> = None;

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim().trim_start_matches('\u{feff}');
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                let name = name.trim().to_string();
                store.section_mut(&name);
                current = Some(name);
                continue;
            }

            let (Some(section), Some((key, value))) = (current.as_deref(), line.split_once('='))
            else {
                return Err(StoreError::Syntax {
                    path: origin.to_path_buf(),
                    line: idx + 1,
                    text: raw.to_string(),
                });
            };

            store.set_value(section, key.trim(), unquote(value.trim()));
        }

        Ok(store)
    }

    /// Write the store atomically: a temp file in the same directory is
    /// renamed over `path`, so a crash never leaves a half-written file.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let write_err = |source| StoreError::Write {
            path: path.to_path_buf(),
            source,
        };

        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(write_err)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(write_err)?;
        tmp.write_all(self.to_string().as_bytes()).map_err(write_err)?;
        tmp.flush().map_err(write_err)?;
        tmp.persist(path).map_err(|e| write_err(e.error))?;

        Ok(())
    }

    pub fn get_value(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section)?
            .entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Like [`get_value`](Self::get_value) but a missing key is an error.
    pub fn require(&self, section: &str, key: &str) -> Result<&str, StoreError> {
        self.get_value(section, key)
            .ok_or_else(|| StoreError::MissingKey {
                section: section.to_string(),
                key: key.to_string(),
            })
    }

    pub fn set_value(&mut self, section: &str, key: &str, value: impl Into<String>) {
        let value = value.into();
        let section = self.section_mut(section);
        match section.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => section.entries.push((key.to_string(), value)),
        }
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.section(name).is_some()
    }

    /// Section names in file order.
    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|s| s.name.as_str())
    }

    fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    fn section_mut(&mut self, name: &str) -> &mut Section {
        let idx = match self.sections.iter().position(|s| s.name == name) {
            Some(idx) => idx,
            None => {
                self.sections.push(Section {
                    name: name.to_string(),
                    entries: Vec::new(),
                });
                self.sections.len() - 1
            }
        };
        &mut self.sections[idx]
    }
}

impl std::fmt::Display for IniStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, section) in self.sections.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            writeln!(f, "[{}]", section.name)?;
            for (key, value) in &section.entries {
                writeln!(f, "{} = {}", key, value)?;
            }
        }
        Ok(())
    }
}

/// Parse a `True`/`False` value (any case).
pub fn parse_bool(value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(format!("expected True or False, found {:?}", other)),
    }
}

pub fn format_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

/// Wrap a value in double quotes so leading/trailing spaces survive a round trip.
pub fn quote(value: &str) -> String {
    format!("\"{}\"", value)
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}
