use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

static CODE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:-]*$").expect("code pattern is a valid regex")
});

/// Whether `value` is a syntactically valid openBIS code, e.g. a dataset code
/// `20240702093837370-684137` or a sample code `QABCD001A0`.
pub fn is_valid_code(value: &str) -> bool {
    CODE_PATTERN.is_match(value)
}

/// Declared data kind of an openBIS property type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataKind {
    Varchar,
    MultilineVarchar,
    Integer,
    Real,
    Boolean,
    Date,
    Timestamp,
    Controlledvocabulary,
    Sample,
    Material,
    Hyperlink,
    Xml,
    Json,
    ArrayInteger,
    ArrayReal,
    ArrayString,
    ArrayTimestamp,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Varchar => "VARCHAR",
            DataKind::MultilineVarchar => "MULTILINE_VARCHAR",
            DataKind::Integer => "INTEGER",
            DataKind::Real => "REAL",
            DataKind::Boolean => "BOOLEAN",
            DataKind::Date => "DATE",
            DataKind::Timestamp => "TIMESTAMP",
            DataKind::Controlledvocabulary => "CONTROLLEDVOCABULARY",
            DataKind::Sample => "SAMPLE",
            DataKind::Material => "MATERIAL",
            DataKind::Hyperlink => "HYPERLINK",
            DataKind::Xml => "XML",
            DataKind::Json => "JSON",
            DataKind::ArrayInteger => "ARRAY_INTEGER",
            DataKind::ArrayReal => "ARRAY_REAL",
            DataKind::ArrayString => "ARRAY_STRING",
            DataKind::ArrayTimestamp => "ARRAY_TIMESTAMP",
        }
    }

    /// Properties of this kind hold the permanent id of another sample.
    pub fn is_sample_reference(&self) -> bool {
        matches!(self, DataKind::Sample)
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataKind {
    type Err = BridgeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let kind = match value.trim() {
            "VARCHAR" => DataKind::Varchar,
            "MULTILINE_VARCHAR" => DataKind::MultilineVarchar,
            "INTEGER" => DataKind::Integer,
            "REAL" => DataKind::Real,
            "BOOLEAN" => DataKind::Boolean,
            "DATE" => DataKind::Date,
            "TIMESTAMP" => DataKind::Timestamp,
            "CONTROLLEDVOCABULARY" => DataKind::Controlledvocabulary,
            "SAMPLE" => DataKind::Sample,
            "MATERIAL" => DataKind::Material,
            "HYPERLINK" => DataKind::Hyperlink,
            "XML" => DataKind::Xml,
            "JSON" => DataKind::Json,
            "ARRAY_INTEGER" => DataKind::ArrayInteger,
            "ARRAY_REAL" => DataKind::ArrayReal,
            "ARRAY_STRING" => DataKind::ArrayString,
            "ARRAY_TIMESTAMP" => DataKind::ArrayTimestamp,
            other => return Err(BridgeError::unmapped("data type", other)),
        };
        Ok(kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyAssignment {
    pub code: String,
    pub label: String,
    pub data_kind: DataKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleType {
    pub code: String,
    pub property_assignments: Vec<PropertyAssignment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub code: String,
    pub identifier: String,
    pub sample_type: SampleType,
    pub properties: BTreeMap<String, String>,
    pub registration_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetFile {
    pub dataset_perm_id: String,
    pub path: String,
    pub is_directory: bool,
    pub file_length: u64,
}

impl DatasetFile {
    /// Last path segment, e.g. `data.csv` for `original/run1/data.csv`.
    pub fn file_name(&self) -> &str {
        self.path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(self.path.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub perm_id: String,
    pub type_code: String,
    pub files: Vec<DatasetFile>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Experiment {
    pub code: String,
    pub perm_id: String,
    pub type_code: String,
    pub identifier: String,
}

/// An experiment together with everything below it, as fetched in one go.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentGraph {
    pub experiment: Experiment,
    pub samples: Vec<Sample>,
    pub datasets: Vec<Dataset>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SampleSummary {
    pub identifier: String,
    pub perm_id: String,
    pub type_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetSummary {
    pub code: String,
    pub type_code: String,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn code_pattern() {
        assert!(is_valid_code("20240702093837370-684137"));
        assert!(is_valid_code("QABCD001A0"));
        assert!(!is_valid_code("bad code"));
        assert!(!is_valid_code("-LEADING"));
    }

    #[test]
    fn unknown_data_kind_is_unmapped() {
        let err = "BLOB".parse::<DataKind>().unwrap_err();
        assert_matches!(err, BridgeError::UnmappedType { .. });
        assert_eq!("SAMPLE".parse::<DataKind>().unwrap(), DataKind::Sample);
    }

    #[test]
    fn file_name_is_last_segment() {
        let file = DatasetFile {
            dataset_perm_id: "D1".to_string(),
            path: "original/run1/data.csv".to_string(),
            is_directory: false,
            file_length: 3,
        };
        assert_eq!(file.file_name(), "data.csv");
    }
}
