//! Tag catalog: the read/rw bindings between device nodes and bus paths.
//!
//! The catalog is a YAML document with two lists:
//!
//! ```yaml
//! read:
//!   - { path: zone1/temperature, node: "ns=3;s=DB1.Temp", type: real }
//! rw:
//!   - { path: zone1/setpoint, node: "ns=3;s=DB1.SP", type: float }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::payload::TypeTag;

/// Catalog errors.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to read catalog {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write catalog {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed catalog {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Failed to serialize catalog: {0}")]
    Serialize(#[from] serde_yaml::Error),
}

/// One catalog entry as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagEntry {
    /// Bus path below the topic prefix
    pub path: String,

    /// Device node address (e.g., "ns=3;s=DB1.SP")
    pub node: String,

    /// Type alias, resolved with [`TypeTag::from_alias`]
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
}

fn default_kind() -> String {
    "float".to_string()
}

impl TagEntry {
    pub fn new(path: impl Into<String>, node: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            node: node.into(),
            kind: kind.into(),
        }
    }
}

/// Whether a binding accepts commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    ReadWrite,
}

/// A catalog entry with its type alias resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagBinding {
    pub path: String,
    pub device_address: String,
    pub type_tag: TypeTag,
    pub direction: Direction,
}

/// The read/rw tag catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagCatalog {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub read: Vec<TagEntry>,

    #[serde(default, deserialize_with = "null_as_empty")]
    pub rw: Vec<TagEntry>,
}

/// `read:` with no items parses as null in YAML.
fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<TagEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<TagEntry>>::deserialize(deserializer)?.unwrap_or_default())
}

impl TagCatalog {
    /// Parse a catalog document. An empty document is an empty catalog.
    pub fn parse(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str::<Option<Self>>(text)?.unwrap_or_default())
    }

    /// Load a catalog file.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let text = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&text).map_err(|source| CatalogError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load a catalog file, treating a missing file as an empty catalog.
    pub fn load_or_empty(path: &Path) -> Result<Self, CatalogError> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "Tag catalog not found, starting with an empty catalog");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Write the catalog as YAML, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<(), CatalogError> {
        let text = serde_yaml::to_string(self)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| CatalogError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        }

        std::fs::write(path, text).map_err(|source| CatalogError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.read.is_empty() && self.rw.is_empty()
    }

    pub fn len(&self) -> usize {
        self.read.len() + self.rw.len()
    }

    /// Append generated entries whose node is not yet bound.
    ///
    /// Existing entries are never modified or removed. Returns the number of
    /// entries added.
    pub fn merge(&mut self, generated: &TagCatalog) -> usize {
        let mut known: HashSet<String> = self
            .read
            .iter()
            .chain(self.rw.iter())
            .map(|e| e.node.clone())
            .collect();

        let mut added = 0;
        for (source, target) in [(&generated.read, &mut self.read), (&generated.rw, &mut self.rw)] {
            for entry in source {
                if entry.node.is_empty() || !known.insert(entry.node.clone()) {
                    continue;
                }
                target.push(entry.clone());
                added += 1;
            }
        }
        added
    }

    /// All entries with resolved type tags, read entries first.
    pub fn bindings(&self) -> Vec<TagBinding> {
        let bind = |entry: &TagEntry, direction| TagBinding {
            path: entry.path.clone(),
            device_address: entry.node.clone(),
            type_tag: TypeTag::from_alias(&entry.kind),
            direction,
        };

        self.read
            .iter()
            .map(|e| bind(e, Direction::Read))
            .chain(self.rw.iter().map(|e| bind(e, Direction::ReadWrite)))
            .collect()
    }
}
