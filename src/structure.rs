//! The SEEK-side view of one openBIS experiment, built by the translator and consumed by the
//! target client. Nothing here is persisted; a structure lives for a single transfer run.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Serialize, Serializer};

use crate::domain::DatasetFile;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct AttributeKey(String);

impl AttributeKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for AttributeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    Text(String),
    Date(NaiveDate),
    Link(String),
}

impl AttributeValue {
    pub fn render(&self) -> String {
        match self {
            AttributeValue::Text(value) | AttributeValue::Link(value) => value.clone(),
            AttributeValue::Date(date) => date.format("%Y-%m-%d").to_string(),
        }
    }
}

impl Serialize for AttributeValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.render())
    }
}

pub type AttributeMap = BTreeMap<AttributeKey, AttributeValue>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assay {
    pub title: String,
    pub assay_class: String,
    pub assay_type_uri: String,
    pub study_id: String,
    pub project_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranslatedSample {
    pub title: String,
    pub sample_type_code: String,
    pub attributes: AttributeMap,
    pub project_id: String,
}

/// How an asset refers back to its openBIS dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "url", rename_all = "snake_case")]
pub enum DatasetLink {
    /// The file content is uploaded; the link is kept for provenance.
    Download(String),
    /// Nothing is uploaded; the link is the only way to reach the data.
    ReferenceOnly(String),
}

impl DatasetLink {
    pub fn url(&self) -> &str {
        match self {
            DatasetLink::Download(url) | DatasetLink::ReferenceOnly(url) => url,
        }
    }

    pub fn transfers_data(&self) -> bool {
        matches!(self, DatasetLink::Download(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Asset {
    pub name: String,
    pub asset_type: String,
    pub file_name: String,
    pub file_length: u64,
    pub dataset_link: DatasetLink,
    pub format_annotations: Vec<String>,
    pub project_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcedAsset {
    pub asset: Asset,
    pub file: DatasetFile,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetStructure {
    assay: Assay,
    source_reference: String,
    samples: BTreeMap<String, TranslatedSample>,
    assets: Vec<SourcedAsset>,
}

impl TargetStructure {
    pub fn new(assay: Assay, source_reference: impl Into<String>) -> Self {
        Self {
            assay,
            source_reference: source_reference.into(),
            samples: BTreeMap::new(),
            assets: Vec::new(),
        }
    }

    /// Adds a sample keyed by its source identifier. A repeated identifier replaces the earlier
    /// one.
    pub fn add_sample(&mut self, sample: TranslatedSample, source_identifier: impl Into<String>) {
        self.samples.insert(source_identifier.into(), sample);
    }

    pub fn add_asset(&mut self, asset: Asset, file: DatasetFile) {
        self.assets.push(SourcedAsset { asset, file });
    }

    pub fn assay(&self) -> &Assay {
        &self.assay
    }

    /// Identifier of the openBIS experiment the assay was translated from.
    pub fn source_reference(&self) -> &str {
        &self.source_reference
    }

    pub fn samples(&self) -> impl Iterator<Item = (&String, &TranslatedSample)> {
        self.samples.iter()
    }

    pub fn sample(&self, source_identifier: &str) -> Option<&TranslatedSample> {
        self.samples.get(source_identifier)
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn assets(&self) -> &[SourcedAsset] {
        &self.assets
    }
}

/// A created asset whose content blob still waits for its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedAsset {
    pub blob_endpoint: String,
    pub dataset_code: String,
    pub file_path: String,
    pub file_length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeWithQueuedAssets {
    pub node_ref: String,
    pub queued_assets: Vec<QueuedAsset>,
}

/// Attribute definition for a SEEK sample type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SampleAttributeDefinition {
    pub title: String,
    pub attribute_type_id: String,
    pub required: bool,
    pub is_title: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranslatedSampleType {
    pub title: String,
    pub attributes: Vec<SampleAttributeDefinition>,
    pub project_id: String,
}
