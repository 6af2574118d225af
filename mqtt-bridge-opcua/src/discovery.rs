//! One-shot address space discovery.
//!
//! Walks the device's object hierarchy breadth-first, records every variable
//! that passes the configured filters, writes a structural export and a
//! generated tag catalog, and optionally appends new nodes to the operator's
//! catalog.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::{CatalogError, TagCatalog, TagEntry};
use crate::config::{BridgeSettings, BrowseConfig};
use crate::device::{AddressSpace, NodeKind};

/// Access level bit for "current write".
const ACCESS_WRITE: u8 = 0x02;

/// Export format version.
const EXPORT_VERSION: u32 = 1;

/// Discovery errors. Never fatal to the session.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to serialize export: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// A discovered variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportNode {
    pub node_id: String,
    /// Raw browse names from the root container
    pub browse_path: Vec<String>,
    /// Normalized, slash-joined path
    pub node_path: String,
    pub display_name: String,
    pub data_type: String,
    pub access_level: u8,
}

impl ExportNode {
    pub fn is_writable(&self) -> bool {
        self.access_level & ACCESS_WRITE != 0
    }
}

/// Structural export of the address space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportArtifact {
    pub version: u32,
    pub generated_at: String,
    pub endpoint: String,
    pub nodes: Vec<ExportNode>,
}

/// Outcome of a discovery run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub variables: usize,
    pub generated_read: usize,
    pub generated_rw: usize,
    /// Entries appended to the operator catalog
    pub merged: usize,
}

/// Whether discovery should run for this process.
///
/// Requires auto-export, and either no previous export or an empty catalog.
pub fn should_run(settings: &BridgeSettings, catalog: &TagCatalog) -> bool {
    settings.auto_export_on_first_run && (!settings.export_file.exists() || catalog.is_empty())
}

/// Normalize one browse name into a path segment.
///
/// German umlauts are transliterated, other common diacritics dropped,
/// letters lower-cased, and every run of other characters collapsed into a
/// single underscore. Leading and trailing underscores are trimmed.
pub fn normalize_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    let mut gap = false;

    for ch in segment.trim().chars() {
        let folded = fold_char(ch);
        for c in folded.chars() {
            if c.is_ascii_alphanumeric() {
                if gap && !out.is_empty() {
                    out.push('_');
                }
                gap = false;
                out.push(c.to_ascii_lowercase());
            } else {
                gap = true;
            }
        }
    }
    out
}

fn fold_char(ch: char) -> String {
    let folded = match ch {
        'ä' => "ae",
        'ö' => "oe",
        'ü' => "ue",
        'Ä' => "Ae",
        'Ö' => "Oe",
        'Ü' => "Ue",
        'ß' => "ss",
        'à' | 'á' | 'â' | 'ã' | 'å' => "a",
        'À' | 'Á' | 'Â' | 'Ã' | 'Å' => "A",
        'ç' => "c",
        'Ç' => "C",
        'è' | 'é' | 'ê' | 'ë' => "e",
        'È' | 'É' | 'Ê' | 'Ë' => "E",
        'ì' | 'í' | 'î' | 'ï' => "i",
        'Ì' | 'Í' | 'Î' | 'Ï' => "I",
        'ñ' => "n",
        'Ñ' => "N",
        'ò' | 'ó' | 'ô' | 'õ' | 'ø' => "o",
        'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ø' => "O",
        'ù' | 'ú' | 'û' => "u",
        'Ù' | 'Ú' | 'Û' => "U",
        'ý' | 'ÿ' => "y",
        'Ý' => "Y",
        other => return other.to_string(),
    };
    folded.to_string()
}

/// Join normalized segments with `/`, dropping empty ones.
pub fn normalize_path<S: AsRef<str>>(segments: &[S]) -> String {
    segments
        .iter()
        .map(|s| normalize_segment(s.as_ref()))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Filters applied during the walk.
struct BrowseFilter<'a> {
    config: &'a BrowseConfig,
}

impl BrowseFilter<'_> {
    /// A branch is excluded if its raw or normalized path starts with an
    /// excluded prefix.
    fn excluded(&self, raw: &str, normalized: &str) -> bool {
        self.config
            .exclude_path_prefixes
            .iter()
            .any(|p| raw.starts_with(p.as_str()) || normalized.starts_with(p.as_str()))
    }

    fn included(&self, top: &str) -> bool {
        let allowed = &self.config.include_only_prefixes;
        allowed.is_empty() || allowed.iter().any(|p| top.starts_with(p.as_str()))
    }

    fn namespace_allowed(&self, namespace: u16) -> bool {
        let filter = &self.config.namespace_filter;
        filter.is_empty() || filter.contains(&namespace)
    }
}

/// Walk the address space and collect variables.
pub async fn browse_export<A>(
    space: &A,
    config: &BrowseConfig,
    endpoint: &str,
) -> ExportArtifact
where
    A: AddressSpace + ?Sized,
{
    let filter = BrowseFilter { config };
    let mut nodes = Vec::new();
    let mut queue: VecDeque<(String, Vec<String>, usize)> = VecDeque::new();
    queue.push_back((space.root(), Vec::new(), 0));

    while let Some((address, parts, depth)) = queue.pop_front() {
        if depth > config.max_depth {
            continue;
        }

        let children = match space.children(&address).await {
            Ok(children) => children,
            Err(e) => {
                tracing::debug!(node = %address, error = %e, "Browse failed, skipping branch");
                continue;
            }
        };

        for child in children {
            let mut path = parts.clone();
            path.push(child.browse_name.clone());

            let raw = path.join("/");
            if filter.excluded(&raw, &normalize_path(&path)) {
                continue;
            }
            if !filter.included(&path[0]) {
                continue;
            }

            if child.kind == NodeKind::Variable {
                if !filter.namespace_allowed(child.namespace) {
                    continue;
                }

                let info = space.variable_info(&child.address).await;
                nodes.push(ExportNode {
                    node_id: child.address.clone(),
                    node_path: normalize_path(&path),
                    display_name: child
                        .display_name
                        .clone()
                        .filter(|name| !name.is_empty())
                        .unwrap_or_else(|| child.browse_name.clone()),
                    data_type: info.data_type.unwrap_or_else(|| "Unknown".to_string()),
                    access_level: info.access_level.unwrap_or(0),
                    browse_path: path.clone(),
                });
            }

            if matches!(child.kind, NodeKind::Object | NodeKind::Variable) {
                queue.push_back((child.address, path, depth + 1));
            }
        }
    }

    tracing::info!(variables = nodes.len(), "Discovery export collected variables");

    ExportArtifact {
        version: EXPORT_VERSION,
        generated_at: timestamp(Utc::now()),
        endpoint: endpoint.to_string(),
        nodes,
    }
}

fn timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Map a discovered data type onto a catalog type alias.
pub fn type_alias(data_type: &str) -> String {
    let alias = match data_type {
        "Boolean" => "bool",
        "Byte" => "byte",
        "Int16" => "int16",
        "UInt16" => "uint16",
        "Int32" => "int32",
        "UInt32" => "uint32",
        "Int64" => "lint",
        "UInt64" => "ulint",
        "Float" => "float",
        "Double" => "double",
        "String" => "string",
        "DateTime" => "datetime",
        other => return other.to_lowercase(),
    };
    alias.to_string()
}

/// Build a catalog from an export, partitioned by write access.
pub fn export_to_catalog(export: &ExportArtifact) -> TagCatalog {
    let mut catalog = TagCatalog::default();

    for node in &export.nodes {
        let entry = TagEntry::new(
            normalize_path(&node.browse_path),
            node.node_id.clone(),
            type_alias(&node.data_type),
        );
        if node.is_writable() {
            catalog.rw.push(entry);
        } else {
            catalog.read.push(entry);
        }
    }
    catalog
}

/// Run discovery and write its artifacts.
pub async fn run<A>(space: &A, settings: &BridgeSettings, endpoint: &str) -> Result<DiscoveryReport, DiscoveryError>
where
    A: AddressSpace + ?Sized,
{
    tracing::info!(endpoint = %endpoint, max_depth = settings.browse.max_depth, "Running address space discovery");

    let export = browse_export(space, &settings.browse, endpoint).await;
    write_export(&export, &settings.export_file)?;

    let generated = export_to_catalog(&export);
    generated.save(&settings.generated_tags_file)?;
    tracing::info!(
        path = %settings.generated_tags_file.display(),
        read = generated.read.len(),
        rw = generated.rw.len(),
        "Generated tag catalog written"
    );

    let mut merged = 0;
    if settings.merge_into_tags_file {
        let mut catalog = TagCatalog::load_or_empty(&settings.tags_file)?;
        merged = catalog.merge(&generated);
        if merged > 0 {
            catalog.save(&settings.tags_file)?;
        }
        tracing::info!(
            path = %settings.tags_file.display(),
            added = merged,
            "Merged discovered tags into catalog"
        );
    }

    Ok(DiscoveryReport {
        variables: export.nodes.len(),
        generated_read: generated.read.len(),
        generated_rw: generated.rw.len(),
        merged,
    })
}

fn write_export(export: &ExportArtifact, path: &Path) -> Result<(), DiscoveryError> {
    let json = serde_json::to_string_pretty(export)?;
    let write_err = |source| DiscoveryError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }
    std::fs::write(path, json).map_err(write_err)?;

    tracing::info!(path = %path.display(), "Discovery export written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BrowseNode, DeviceError, VariableInfo};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::HashMap;

    /// Static address space: parent -> children, address -> info.
    #[derive(Default)]
    struct Tree {
        children: HashMap<String, Vec<BrowseNode>>,
        info: HashMap<String, VariableInfo>,
    }

    impl Tree {
        fn add(&mut self, parent: &str, address: &str, ns: u16, name: &str, kind: NodeKind) {
            self.children
                .entry(parent.to_string())
                .or_default()
                .push(BrowseNode {
                    address: address.to_string(),
                    namespace: ns,
                    browse_name: name.to_string(),
                    display_name: None,
                    kind,
                });
        }

        fn var(&mut self, parent: &str, address: &str, name: &str, data_type: &str, access: u8) {
            self.add(parent, address, 3, name, NodeKind::Variable);
            self.info.insert(
                address.to_string(),
                VariableInfo {
                    data_type: Some(data_type.to_string()),
                    access_level: Some(access),
                },
            );
        }
    }

    #[async_trait]
    impl AddressSpace for Tree {
        fn root(&self) -> String {
            "i=85".to_string()
        }

        async fn children(&self, address: &str) -> Result<Vec<BrowseNode>, DeviceError> {
            self.children
                .get(address)
                .cloned()
                .ok_or_else(|| DeviceError::Browse(address.to_string()))
        }

        async fn variable_info(&self, address: &str) -> VariableInfo {
            self.info.get(address).cloned().unwrap_or_default()
        }
    }

    fn plant() -> Tree {
        let mut tree = Tree::default();
        tree.add("i=85", "i=2253", 0, "Server", NodeKind::Object);
        tree.add("i=2253", "i=2256", 0, "ServerStatus", NodeKind::Variable);
        tree.add("i=85", "ns=3;s=DB1", 3, "DB1 Heizung", NodeKind::Object);
        tree.var("ns=3;s=DB1", "ns=3;s=DB1.Temp", "Temperatur Kessel", "Float", 0x01);
        tree.var("ns=3;s=DB1", "ns=3;s=DB1.SP", "Sollwert", "Float", 0x03);
        tree.var("ns=3;s=DB1", "ns=3;s=DB1.On", "Pumpe Ein", "Boolean", 0x03);
        tree.add("ns=3;s=DB1", "ns=3;s=DB1.Sub", 3, "Über", NodeKind::Object);
        tree.var("ns=3;s=DB1.Sub", "ns=3;s=DB1.Sub.Deep", "Tief", "Int16", 0x01);
        tree.add("i=85", "ns=3;s=Other", 3, "Other", NodeKind::Object);
        tree.var("ns=3;s=Other", "ns=3;s=Other.X", "X", "Double", 0x03);
        tree
    }

    fn settings(dir: &Path) -> BridgeSettings {
        BridgeSettings {
            tags_file: dir.join("tags.yaml"),
            export_file: dir.join("export/opcua-structure.json"),
            generated_tags_file: dir.join("tags.generated.yaml"),
            auto_export_on_first_run: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_segment() {
        assert_eq!(normalize_segment("Temperatur Kessel"), "temperatur_kessel");
        assert_eq!(normalize_segment("Über-Druck (bar)"), "ueber_druck_bar");
        assert_eq!(normalize_segment("  Straße  "), "strasse");
        assert_eq!(normalize_segment("Café.Temp"), "cafe_temp");
        assert_eq!(normalize_segment("__a__b__"), "a_b");
        assert_eq!(normalize_segment("---"), "");
    }

    #[test]
    fn test_normalize_path_drops_empty_segments() {
        assert_eq!(normalize_path(&["DB1", " ", "Sollwert"]), "db1/sollwert");
    }

    #[test]
    fn test_type_alias() {
        assert_eq!(type_alias("Boolean"), "bool");
        assert_eq!(type_alias("Int16"), "int16");
        assert_eq!(type_alias("Float"), "float");
        assert_eq!(type_alias("LocalizedText"), "localizedtext");
        assert_eq!(type_alias("Unknown"), "unknown");
    }

    #[test]
    fn test_timestamp_format() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        assert_eq!(timestamp(now), "2024-05-01T10:00:00Z");
    }

    #[tokio::test]
    async fn test_browse_applies_filters() {
        let tree = plant();
        let export = browse_export(&tree, &BrowseConfig::default(), "opc.tcp://plc:4840").await;

        let ids: Vec<&str> = export.nodes.iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "ns=3;s=DB1.Temp",
                "ns=3;s=DB1.SP",
                "ns=3;s=DB1.On",
                "ns=3;s=DB1.Sub.Deep"
            ]
        );

        let deep = &export.nodes[3];
        assert_eq!(deep.browse_path, vec!["DB1 Heizung", "Über", "Tief"]);
        assert_eq!(deep.node_path, "db1_heizung/ueber/tief");
        assert_eq!(deep.display_name, "Tief");
        assert_eq!(deep.data_type, "Int16");
        assert_eq!(export.version, 1);
        assert_eq!(export.endpoint, "opc.tcp://plc:4840");
    }

    #[tokio::test]
    async fn test_browse_max_depth() {
        let tree = plant();
        let config = BrowseConfig {
            max_depth: 1,
            ..Default::default()
        };

        let export = browse_export(&tree, &config, "").await;
        assert_eq!(export.nodes.len(), 3);
        assert!(export.nodes.iter().all(|n| n.browse_path.len() == 2));
    }

    #[tokio::test]
    async fn test_browse_without_include_filter() {
        let tree = plant();
        let config = BrowseConfig {
            include_only_prefixes: vec![],
            namespace_filter: vec![],
            ..Default::default()
        };

        let export = browse_export(&tree, &config, "").await;
        let ids: Vec<&str> = export.nodes.iter().map(|n| n.node_id.as_str()).collect();
        assert!(ids.contains(&"ns=3;s=Other.X"));
        // Server/ServerStatus is excluded by prefix
        assert!(!ids.contains(&"i=2256"));
    }

    #[tokio::test]
    async fn test_export_to_catalog_partitions_by_access() {
        let tree = plant();
        let export = browse_export(&tree, &BrowseConfig::default(), "").await;
        let catalog = export_to_catalog(&export);

        assert_eq!(
            catalog.read,
            vec![
                TagEntry::new("db1_heizung/temperatur_kessel", "ns=3;s=DB1.Temp", "float"),
                TagEntry::new("db1_heizung/ueber/tief", "ns=3;s=DB1.Sub.Deep", "int16"),
            ]
        );
        assert_eq!(catalog.rw.len(), 2);
        assert_eq!(catalog.rw[1].kind, "bool");
    }

    #[test]
    fn test_should_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        let populated = TagCatalog {
            read: vec![TagEntry::new("a", "n", "bool")],
            rw: vec![],
        };

        assert!(should_run(&settings, &populated));

        std::fs::create_dir_all(settings.export_file.parent().unwrap()).unwrap();
        std::fs::write(&settings.export_file, "{}").unwrap();
        assert!(!should_run(&settings, &populated));
        assert!(should_run(&settings, &TagCatalog::default()));

        settings.auto_export_on_first_run = false;
        assert!(!should_run(&settings, &TagCatalog::default()));
    }

    #[tokio::test]
    async fn test_run_writes_artifacts_and_merges() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        TagCatalog {
            read: vec![],
            rw: vec![TagEntry::new("zone1/setpoint", "ns=3;s=DB1.SP", "float")],
        }
        .save(&settings.tags_file)
        .unwrap();

        let report = run(&plant(), &settings, "opc.tcp://plc:4840").await.unwrap();
        assert_eq!(report.variables, 4);
        assert_eq!(report.merged, 3);

        let export: ExportArtifact =
            serde_json::from_str(&std::fs::read_to_string(&settings.export_file).unwrap()).unwrap();
        assert_eq!(export.nodes.len(), 4);

        let generated = TagCatalog::load(&settings.generated_tags_file).unwrap();
        assert_eq!(generated.len(), 4);

        let merged = TagCatalog::load(&settings.tags_file).unwrap();
        assert_eq!(merged.rw[0], TagEntry::new("zone1/setpoint", "ns=3;s=DB1.SP", "float"));
        assert_eq!(merged.len(), 4);

        // A second run adds nothing and leaves the catalog untouched.
        let before = std::fs::read(&settings.tags_file).unwrap();
        let report = run(&plant(), &settings, "opc.tcp://plc:4840").await.unwrap();
        assert_eq!(report.merged, 0);
        assert_eq!(std::fs::read(&settings.tags_file).unwrap(), before);
    }

    #[tokio::test]
    async fn test_run_without_merge_leaves_catalog_alone() {
        let dir = tempfile::tempdir().unwrap();
        let settings = BridgeSettings {
            merge_into_tags_file: false,
            ..settings(dir.path())
        };

        let report = run(&plant(), &settings, "").await.unwrap();
        assert_eq!(report.merged, 0);
        assert!(!settings.tags_file.exists());
        assert!(settings.generated_tags_file.exists());
    }
}
