use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;

use camino::Utf8Path;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::domain::DataKind;
use crate::error::BridgeError;

pub const ASSAY_CLASS_FILE: &str = "experiment_type_to_assay_class.json";
pub const ASSAY_TYPE_FILE: &str = "experiment_type_to_assay_type.json";
pub const ASSET_TYPE_FILE: &str = "dataset_type_to_asset_type.json";
pub const ATTRIBUTE_TYPE_FILE: &str = "data_type_to_attribute_type.json";
pub const FORMAT_FILE: &str = "file_extension_to_format.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingKind {
    AssayClass,
    AssayType,
    AssetType,
}

impl MappingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingKind::AssayClass => "assay class",
            MappingKind::AssayType => "assay type",
            MappingKind::AssetType => "asset type",
        }
    }
}

impl fmt::Display for MappingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A SEEK sample attribute type, identified by its id in the target instance. Other keys in the
/// table entry (title, base type) are documentation for the reader and ignored here.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AttributeType {
    pub id: String,
}

/// Lookup tables translating openBIS type codes to SEEK categories.
#[derive(Debug, Clone, Default)]
pub struct TypeMappingRegistry {
    tables: HashMap<MappingKind, BTreeMap<String, String>>,
    attribute_types: HashMap<DataKind, AttributeType>,
    format_annotations: BTreeMap<String, String>,
}

impl TypeMappingRegistry {
    pub fn new(
        assay_classes: BTreeMap<String, String>,
        assay_types: BTreeMap<String, String>,
        asset_types: BTreeMap<String, String>,
        attribute_types: HashMap<DataKind, AttributeType>,
    ) -> Self {
        let mut tables = HashMap::new();
        tables.insert(MappingKind::AssayClass, assay_classes);
        tables.insert(MappingKind::AssayType, assay_types);
        tables.insert(MappingKind::AssetType, asset_types);
        Self {
            tables,
            attribute_types,
            format_annotations: default_format_annotations(),
        }
    }

    /// Loads every table from `dir`. The format table is optional and falls back to the
    /// built-in EDAM annotations.
    pub fn load(dir: &Utf8Path) -> Result<Self, BridgeError> {
        let assay_classes = read_table(&dir.join(ASSAY_CLASS_FILE))?;
        let assay_types = read_table(&dir.join(ASSAY_TYPE_FILE))?;
        let asset_types = read_table(&dir.join(ASSET_TYPE_FILE))?;
        let raw_attribute_types: BTreeMap<String, AttributeType> =
            read_table(&dir.join(ATTRIBUTE_TYPE_FILE))?;

        let attribute_types = raw_attribute_types
            .into_iter()
            .map(|(kind, attribute_type)| {
                let kind = kind.parse::<DataKind>().map_err(|_| BridgeError::MappingParse {
                    path: dir.join(ATTRIBUTE_TYPE_FILE).into_std_path_buf(),
                    message: format!("unknown openBIS data type {kind}"),
                })?;
                Ok((kind, attribute_type))
            })
            .collect::<Result<HashMap<_, _>, BridgeError>>()?;

        let mut registry = Self::new(assay_classes, assay_types, asset_types, attribute_types);
        let format_path = dir.join(FORMAT_FILE);
        if format_path.exists() {
            registry.format_annotations = read_table(&format_path)?;
        }
        debug!(
            dir = %dir,
            attribute_types = registry.attribute_types.len(),
            formats = registry.format_annotations.len(),
            "loaded type mappings"
        );
        Ok(registry)
    }

    pub fn resolve(&self, kind: MappingKind, code: &str) -> Result<&str, BridgeError> {
        self.tables
            .get(&kind)
            .and_then(|table| table.get(code))
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| BridgeError::unmapped(kind.as_str(), code))
    }

    pub fn attribute_type(&self, kind: DataKind) -> Result<&AttributeType, BridgeError> {
        self.attribute_types
            .get(&kind)
            .filter(|attribute_type| !attribute_type.id.trim().is_empty())
            .ok_or_else(|| BridgeError::unmapped("attribute type", kind.as_str()))
    }

    /// Format annotation for a file name. The longest matching suffix wins, so `reads.fastq.gz`
    /// picks the `fastq.gz` entry before `gz`.
    pub fn format_annotation(&self, file_name: &str) -> Option<&str> {
        let mut rest = file_name;
        while let Some((_, extension)) = rest.split_once('.') {
            if let Some(annotation) = self.format_annotations.get(extension) {
                return Some(annotation.as_str());
            }
            rest = extension;
        }
        None
    }
}

fn read_table<T: DeserializeOwned>(path: &Utf8Path) -> Result<T, BridgeError> {
    let content = fs::read_to_string(path)
        .map_err(|_| BridgeError::MappingRead(path.to_path_buf().into_std_path_buf()))?;
    serde_json::from_str(&content).map_err(|err| BridgeError::MappingParse {
        path: path.to_path_buf().into_std_path_buf(),
        message: err.to_string(),
    })
}

pub fn default_format_annotations() -> BTreeMap<String, String> {
    [
        ("fastq.gz", "http://edamontology.org/format_1930"),
        ("fastq", "http://edamontology.org/format_1930"),
        ("json", "http://edamontology.org/format_3464"),
        ("yaml", "http://edamontology.org/format_3750"),
        ("raw", "http://edamontology.org/format_3712"),
        ("tsv", "http://edamontology.org/format_3475"),
        ("csv", "http://edamontology.org/format_3752"),
        ("txt", "http://edamontology.org/format_2330"),
    ]
    .into_iter()
    .map(|(extension, format)| (extension.to_string(), format.to_string()))
    .collect()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn registry() -> TypeMappingRegistry {
        let asset_types = BTreeMap::from([
            ("RAW".to_string(), "Data".to_string()),
            ("BLANK".to_string(), "  ".to_string()),
        ]);
        TypeMappingRegistry::new(
            BTreeMap::new(),
            BTreeMap::new(),
            asset_types,
            HashMap::new(),
        )
    }

    #[test]
    fn resolve_mapped_type() {
        assert_eq!(
            registry().resolve(MappingKind::AssetType, "RAW").unwrap(),
            "Data"
        );
    }

    #[test]
    fn blank_and_missing_entries_are_unmapped() {
        let registry = registry();
        assert_matches!(
            registry.resolve(MappingKind::AssetType, "BLANK"),
            Err(BridgeError::UnmappedType { .. })
        );
        assert_matches!(
            registry.resolve(MappingKind::AssetType, "PROCESSED"),
            Err(BridgeError::UnmappedType { code, .. }) if code == "PROCESSED"
        );
        assert_matches!(
            registry.attribute_type(DataKind::Varchar),
            Err(BridgeError::UnmappedType { .. })
        );
    }

    #[test]
    fn format_prefers_longest_suffix() {
        let registry = registry();
        assert_eq!(
            registry.format_annotation("reads.fastq.gz"),
            Some("http://edamontology.org/format_1930")
        );
        assert_eq!(
            registry.format_annotation("table.csv"),
            Some("http://edamontology.org/format_3752")
        );
        assert_eq!(registry.format_annotation("archive.tar.bz2"), None);
        assert_eq!(registry.format_annotation("README"), None);
    }
}
