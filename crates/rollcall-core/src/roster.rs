//! Employee roster: the labeled reference images to match against.
//!
//! A roster is either the built-in default or a TOML file:
//!
//! ```toml
//! [[employee]]
//! name = "Abhay Kadam"
//! image = "AbhayKadam.jpg"
//! ```
//!
//! Relative image paths resolve against the reference directory.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RosterError {
    #[error("cannot read roster {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse roster {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("roster {0} lists no employees")]
    Empty(PathBuf),
    #[error("roster entry {index} has an empty name")]
    UnnamedEntry { index: usize },
}

/// One labeled reference image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceEntry {
    pub name: String,
    pub image: PathBuf,
}

impl ReferenceEntry {
    pub fn new(name: impl Into<String>, image: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
        }
    }
}

/// Ordered list of reference entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roster {
    #[serde(rename = "employee", default)]
    pub employees: Vec<ReferenceEntry>,
}

impl Roster {
    /// The two built-in employees, with images under `reference_dir`.
    pub fn builtin(reference_dir: &Path) -> Self {
        Self {
            employees: vec![
                ReferenceEntry::new("Abhay Kadam", reference_dir.join("AbhayKadam.jpg")),
                ReferenceEntry::new("Aditi Kotecha", reference_dir.join("AditiKotechaa.jpg")),
            ],
        }
    }

    /// Parse a roster file, resolving relative image paths against `reference_dir`.
    pub fn load(path: &Path, reference_dir: &Path) -> Result<Self, RosterError> {
        let raw = std::fs::read_to_string(path).map_err(|source| RosterError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut roster: Roster = toml::from_str(&raw).map_err(|source| RosterError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if roster.employees.is_empty() {
            return Err(RosterError::Empty(path.to_path_buf()));
        }
        for (index, entry) in roster.employees.iter_mut().enumerate() {
            if entry.name.trim().is_empty() {
                return Err(RosterError::UnnamedEntry { index });
            }
            if entry.image.is_relative() {
                entry.image = reference_dir.join(&entry.image);
            }
        }
        Ok(roster)
    }

    /// Load from `path` when given, otherwise fall back to the built-in roster.
    pub fn resolve(path: Option<&Path>, reference_dir: &Path) -> Result<Self, RosterError> {
        match path {
            Some(p) => Self::load(p, reference_dir),
            None => Ok(Self::builtin(reference_dir)),
        }
    }

    pub fn len(&self) -> usize {
        self.employees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.employees.is_empty()
    }

    /// Hex SHA-256 over the ordered (name, image) pairs.
    pub fn content_key(&self) -> String {
        let mut hasher = Sha256::new();
        for entry in &self.employees {
            hasher.update(entry.name.as_bytes());
            hasher.update([0u8]);
            hasher.update(entry.image.to_string_lossy().as_bytes());
            hasher.update([0u8]);
        }
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}
