use std::collections::{BTreeMap, HashSet};
use std::io::{Cursor, Read};
use std::sync::Mutex;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use chrono::{TimeZone, Utc};

use openbis_seek_bridge::config::{AttributeNames, OpenbisSettings, ResolvedConfig, SeekSettings};
use openbis_seek_bridge::domain::{
    DataKind, Dataset, DatasetFile, DatasetSummary, Experiment, ExperimentGraph,
    PropertyAssignment, Sample, SampleSummary, SampleType,
};
use openbis_seek_bridge::error::BridgeError;
use openbis_seek_bridge::mapping::{AttributeType, TypeMappingRegistry};
use openbis_seek_bridge::openbis::SourceClient;
use openbis_seek_bridge::seek::{StreamOpener, TargetClient};
use openbis_seek_bridge::structure::{
    AttributeKey, AttributeValue, NodeWithQueuedAssets, QueuedAsset, TargetStructure,
    TranslatedSampleType,
};
use openbis_seek_bridge::sync::{
    ProgressEvent, ProgressSink, SyncAction, SyncOptions, SyncOrchestrator,
};
use openbis_seek_bridge::translator::TranslationEngine;

#[derive(Default)]
struct RecordingSink {
    messages: Mutex<Vec<String>>,
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.messages.lock().unwrap().push(event.message);
    }
}

struct MockSource {
    graph: ExperimentGraph,
    sample_types: Vec<SampleType>,
}

impl SourceClient for MockSource {
    fn list_spaces(&self) -> Result<Vec<String>, BridgeError> {
        Ok(vec!["SPACE".to_string()])
    }

    fn find_experiment(&self, id: &str) -> Result<Option<Experiment>, BridgeError> {
        let experiment = &self.graph.experiment;
        Ok((id == experiment.identifier || id == experiment.perm_id).then(|| experiment.clone()))
    }

    fn find_sample(&self, _id: &str) -> Result<Option<SampleSummary>, BridgeError> {
        Ok(None)
    }

    fn find_datasets(&self, codes: &[String]) -> Result<Vec<DatasetSummary>, BridgeError> {
        Ok(self
            .graph
            .datasets
            .iter()
            .filter(|dataset| codes.contains(&dataset.perm_id))
            .map(|dataset| DatasetSummary {
                code: dataset.perm_id.clone(),
                type_code: dataset.type_code.clone(),
            })
            .collect())
    }

    fn experiment_with_descendants(&self, _id: &str) -> Result<ExperimentGraph, BridgeError> {
        Ok(self.graph.clone())
    }

    fn sample_types(&self) -> Result<Vec<SampleType>, BridgeError> {
        Ok(self.sample_types.clone())
    }

    fn stream_file(
        &self,
        dataset_code: &str,
        path: &str,
    ) -> Result<Box<dyn Read + Send>, BridgeError> {
        Ok(Box::new(Cursor::new(
            format!("{dataset_code}/{path}").into_bytes(),
        )))
    }
}

#[derive(Default)]
struct MockTarget {
    hits: Vec<String>,
    existing_sample_types: Vec<String>,
    failing_upload: Option<String>,
    calls: Mutex<Vec<String>>,
    structures: Mutex<Vec<TargetStructure>>,
    uploads: Mutex<Vec<(String, Vec<u8>)>>,
    created_sample_types: Mutex<Vec<TranslatedSampleType>>,
}

impl MockTarget {
    fn with_hits(hits: &[&str]) -> Self {
        Self {
            hits: hits.iter().map(|hit| hit.to_string()).collect(),
            ..Self::default()
        }
    }

    fn queue(structure: &TargetStructure, transfer_data: bool) -> Vec<QueuedAsset> {
        if !transfer_data {
            return Vec::new();
        }
        structure
            .assets()
            .iter()
            .enumerate()
            .map(|(index, sourced)| QueuedAsset {
                blob_endpoint: format!(
                    "https://seek.test/data_files/{index}/content_blobs/{index}"
                ),
                dataset_code: sourced.file.dataset_perm_id.clone(),
                file_path: sourced.file.path.clone(),
                file_length: sourced.file.file_length,
            })
            .collect()
    }
}

impl TargetClient for MockTarget {
    fn search_nodes_by_keyword(&self, keyword: &str) -> Result<Vec<String>, BridgeError> {
        self.calls.lock().unwrap().push(format!("search {keyword}"));
        Ok(self.hits.clone())
    }

    fn create_node(
        &self,
        structure: &TargetStructure,
        transfer_data: bool,
    ) -> Result<NodeWithQueuedAssets, BridgeError> {
        self.calls.lock().unwrap().push("create".to_string());
        self.structures.lock().unwrap().push(structure.clone());
        Ok(NodeWithQueuedAssets {
            node_ref: "https://seek.test/assays/1".to_string(),
            queued_assets: Self::queue(structure, transfer_data),
        })
    }

    fn update_node(
        &self,
        structure: &TargetStructure,
        node_id: &str,
        transfer_data: bool,
    ) -> Result<NodeWithQueuedAssets, BridgeError> {
        self.calls.lock().unwrap().push(format!("update {node_id}"));
        self.structures.lock().unwrap().push(structure.clone());
        Ok(NodeWithQueuedAssets {
            node_ref: format!("https://seek.test/assays/{node_id}"),
            queued_assets: Self::queue(structure, transfer_data),
        })
    }

    fn upload_blob(
        &self,
        asset: &QueuedAsset,
        open: StreamOpener<'_>,
    ) -> Result<String, BridgeError> {
        if self.failing_upload.as_deref() == Some(asset.file_path.as_str()) {
            return Err(BridgeError::SeekStatus {
                status: 500,
                message: "storage full".to_string(),
            });
        }
        let mut bytes = Vec::new();
        open()?
            .read_to_end(&mut bytes)
            .map_err(|err| BridgeError::SeekHttp(err.to_string()))?;
        self.uploads
            .lock()
            .unwrap()
            .push((asset.blob_endpoint.clone(), bytes));
        Ok(format!("{}/download", asset.blob_endpoint))
    }

    fn sample_type_exists(&self, code: &str) -> Result<bool, BridgeError> {
        Ok(self.existing_sample_types.iter().any(|existing| existing == code))
    }

    fn create_sample_type(
        &self,
        sample_type: &TranslatedSampleType,
    ) -> Result<String, BridgeError> {
        let mut created = self.created_sample_types.lock().unwrap();
        created.push(sample_type.clone());
        Ok(created.len().to_string())
    }
}

fn config() -> ResolvedConfig {
    ResolvedConfig {
        openbis: OpenbisSettings {
            as_url: "https://openbis.test".to_string(),
            dss_url: "https://openbis.test".to_string(),
            user: "reader".to_string(),
            base_url: "https://openbis.test/eln".to_string(),
        },
        seek: SeekSettings {
            url: "https://seek.test".to_string(),
            user: "writer".to_string(),
            default_project: "1".to_string(),
            default_study: "2".to_string(),
        },
        attributes: AttributeNames {
            sample_title: "openBIS Name".to_string(),
            registration_date: "Registration Date".to_string(),
        },
        mappings_dir: Utf8PathBuf::from("mappings"),
    }
}

fn engine() -> TranslationEngine {
    let attribute_types = [DataKind::Varchar, DataKind::Date, DataKind::Integer]
        .into_iter()
        .enumerate()
        .map(|(index, kind)| {
            (
                kind,
                AttributeType {
                    id: (index + 1).to_string(),
                },
            )
        })
        .collect();
    let registry = TypeMappingRegistry::new(
        BTreeMap::from([("MS".to_string(), "EXP".to_string())]),
        BTreeMap::from([(
            "MS".to_string(),
            "http://jermontology.org/ontology/JERMOntology#Proteomics".to_string(),
        )]),
        BTreeMap::from([("RAW".to_string(), "data_files".to_string())]),
        attribute_types,
    );
    TranslationEngine::new(registry, &config())
}

fn file(dataset: &str, path: &str, is_directory: bool) -> DatasetFile {
    DatasetFile {
        dataset_perm_id: dataset.to_string(),
        path: path.to_string(),
        is_directory,
        file_length: if is_directory { 0 } else { path.len() as u64 },
    }
}

fn sample(code: &str) -> Sample {
    let mut properties = BTreeMap::new();
    if code == "S1" {
        properties.insert("COLOR".to_string(), "red".to_string());
    }
    Sample {
        code: code.to_string(),
        identifier: format!("/SPACE/{code}"),
        sample_type: SampleType {
            code: "TYPE_A".to_string(),
            property_assignments: vec![PropertyAssignment {
                code: "COLOR".to_string(),
                label: "color".to_string(),
                data_kind: DataKind::Varchar,
            }],
        },
        properties,
        registration_date: Utc.with_ymd_and_hms(2024, 7, 2, 9, 38, 37).unwrap(),
    }
}

fn graph() -> ExperimentGraph {
    ExperimentGraph {
        experiment: Experiment {
            code: "EXP1".to_string(),
            perm_id: "P1".to_string(),
            type_code: "MS".to_string(),
            identifier: "/SPACE/PROJECT/EXP1".to_string(),
        },
        samples: vec![sample("S1")],
        datasets: vec![Dataset {
            perm_id: "D1".to_string(),
            type_code: "RAW".to_string(),
            files: vec![
                file("D1", "original", true),
                file("D1", "original/data.csv", false),
                file("D1", "  ", false),
            ],
        }],
    }
}

fn source() -> MockSource {
    MockSource {
        graph: graph(),
        sample_types: Vec::new(),
    }
}

#[test]
fn new_experiment_creates_assay_with_sample_and_asset() {
    let orchestrator = SyncOrchestrator::new(source(), MockTarget::default(), engine());
    let sink = RecordingSink::default();
    let result = orchestrator
        .sync_experiment("/SPACE/PROJECT/EXP1", &SyncOptions::default(), &sink)
        .unwrap();

    assert_eq!(result.action, SyncAction::Created);
    assert_eq!(result.samples, 1);
    assert_eq!(result.assets, 1);
    assert!(result.uploaded.is_empty());
    assert!(
        sink.messages
            .lock()
            .unwrap()
            .iter()
            .any(|message| message == "state=Creating")
    );
}

#[test]
fn translated_structure_matches_source_experiment() {
    let orchestrator = SyncOrchestrator::new(source(), MockTarget::default(), engine());
    orchestrator
        .sync_experiment(
            "/SPACE/PROJECT/EXP1",
            &SyncOptions::default(),
            &RecordingSink::default(),
        )
        .unwrap();

    let structures = orchestrator.target().structures.lock().unwrap();
    let structure = &structures[0];
    assert_eq!(structure.assay().title, "EXP1 (P1)");
    assert_eq!(structure.assay().assay_class, "EXP");

    let sample = structure.sample("/SPACE/S1").unwrap();
    assert_eq!(sample.attributes.len(), 3);
    assert_eq!(
        sample.attributes.get(&AttributeKey::new("color")),
        Some(&AttributeValue::Text("red".to_string()))
    );
    assert_eq!(
        sample.attributes.get(&AttributeKey::new("openBIS Name")),
        Some(&AttributeValue::Text("/SPACE/S1".to_string()))
    );
    assert_eq!(
        sample
            .attributes
            .get(&AttributeKey::new("Registration Date"))
            .map(AttributeValue::render),
        Some("2024-07-02".to_string())
    );

    let assets = structure.assets();
    assert_eq!(assets.len(), 1);
    assert_eq!(assets[0].asset.name, "D1: data.csv");
    assert_eq!(assets[0].asset.asset_type, "data_files");
    assert_eq!(
        assets[0].asset.format_annotations,
        vec!["http://edamontology.org/format_3752".to_string()]
    );
    assert_eq!(assets[0].file.path, "original/data.csv");
}

#[test]
fn existing_assay_takes_update_path() {
    let orchestrator = SyncOrchestrator::new(source(), MockTarget::with_hits(&["17"]), engine());
    let result = orchestrator
        .sync_experiment("P1", &SyncOptions::default(), &RecordingSink::default())
        .unwrap();

    assert_eq!(result.action, SyncAction::Updated);
    assert_eq!(result.assay, "https://seek.test/assays/17");
}

#[test]
fn ambiguous_search_neither_creates_nor_updates() {
    let target = MockTarget::with_hits(&["3", "4"]);
    let orchestrator = SyncOrchestrator::new(source(), target, engine());
    let err = orchestrator
        .sync_experiment(
            "/SPACE/PROJECT/EXP1",
            &SyncOptions::default(),
            &RecordingSink::default(),
        )
        .unwrap_err();

    assert_matches!(
        err,
        BridgeError::AmbiguousMatch { keyword, candidates }
            if keyword == "P1" && candidates == vec!["3".to_string(), "4".to_string()]
    );
    assert_eq!(
        *orchestrator.target().calls.lock().unwrap(),
        vec!["search P1".to_string()]
    );
}

#[test]
fn transfer_streams_each_queued_file() {
    let orchestrator = SyncOrchestrator::new(source(), MockTarget::default(), engine());
    let options = SyncOptions {
        transfer_data: true,
        ..SyncOptions::default()
    };
    let result = orchestrator
        .sync_experiment("/SPACE/PROJECT/EXP1", &options, &RecordingSink::default())
        .unwrap();

    assert_eq!(result.uploaded.len(), 1);
    assert_eq!(result.uploaded[0].file_path, "original/data.csv");
    assert_eq!(
        result.uploaded[0].location,
        "https://seek.test/data_files/0/content_blobs/0/download"
    );
}

#[test]
fn failed_upload_aborts_after_earlier_uploads() {
    let mut graph = graph();
    graph.datasets[0]
        .files
        .push(file("D1", "original/second.csv", false));
    let source = MockSource {
        graph,
        sample_types: Vec::new(),
    };
    let target = MockTarget {
        failing_upload: Some("original/second.csv".to_string()),
        ..MockTarget::default()
    };
    let orchestrator = SyncOrchestrator::new(source, target, engine());
    let options = SyncOptions {
        transfer_data: true,
        ..SyncOptions::default()
    };
    let err = orchestrator
        .sync_experiment("/SPACE/PROJECT/EXP1", &options, &RecordingSink::default())
        .unwrap_err();

    assert_matches!(err, BridgeError::SeekStatus { status: 500, .. });
    let uploads = orchestrator.target().uploads.lock().unwrap();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].1, b"D1/original/data.csv".to_vec());
}

#[test]
fn blacklists_remove_samples_and_datasets() {
    let mut graph = graph();
    graph.samples.push(sample("S2"));
    let source = MockSource {
        graph,
        sample_types: Vec::new(),
    };
    let orchestrator = SyncOrchestrator::new(source, MockTarget::default(), engine());
    let options = SyncOptions {
        dataset_blacklist: HashSet::from(["D1".to_string()]),
        sample_blacklist: HashSet::from(["S1".to_string()]),
        ..SyncOptions::default()
    };
    let result = orchestrator
        .sync_experiment("/SPACE/PROJECT/EXP1", &options, &RecordingSink::default())
        .unwrap();

    assert_eq!(result.samples, 1);
    assert_eq!(result.assets, 0);
}

#[test]
fn unmapped_dataset_type_stops_before_writes() {
    let mut graph = graph();
    graph.datasets[0].type_code = "PROCESSED".to_string();
    let source = MockSource {
        graph,
        sample_types: Vec::new(),
    };
    let orchestrator = SyncOrchestrator::new(source, MockTarget::default(), engine());
    let err = orchestrator
        .sync_experiment(
            "/SPACE/PROJECT/EXP1",
            &SyncOptions::default(),
            &RecordingSink::default(),
        )
        .unwrap_err();

    assert_matches!(err, BridgeError::UnmappedType { code, .. } if code == "PROCESSED");
    assert_eq!(
        *orchestrator.target().calls.lock().unwrap(),
        vec!["search P1".to_string()]
    );
}

#[test]
fn ambiguous_search_wins_over_unmapped_dataset_type() {
    let mut graph = graph();
    graph.datasets[0].type_code = "PROCESSED".to_string();
    let source = MockSource {
        graph,
        sample_types: Vec::new(),
    };
    let orchestrator = SyncOrchestrator::new(source, MockTarget::with_hits(&["3", "4"]), engine());
    let err = orchestrator
        .sync_experiment(
            "/SPACE/PROJECT/EXP1",
            &SyncOptions::default(),
            &RecordingSink::default(),
        )
        .unwrap_err();

    assert_matches!(
        err,
        BridgeError::AmbiguousMatch { keyword, candidates }
            if keyword == "P1" && candidates == vec!["3".to_string(), "4".to_string()]
    );
}

#[test]
fn dataset_code_is_not_transferable() {
    let orchestrator = SyncOrchestrator::new(source(), MockTarget::default(), engine());
    let err = orchestrator
        .sync_experiment("D1", &SyncOptions::default(), &RecordingSink::default())
        .unwrap_err();

    assert_matches!(err, BridgeError::UnsupportedObject { kind, .. } if kind == "dataset");
}

#[test]
fn sample_types_skip_blacklisted_and_existing() {
    let sample_type = |code: &str| SampleType {
        code: code.to_string(),
        property_assignments: vec![PropertyAssignment {
            code: "VOLUME".to_string(),
            label: "Volume".to_string(),
            data_kind: DataKind::Integer,
        }],
    };
    let source = MockSource {
        graph: graph(),
        sample_types: vec![sample_type("KEEP"), sample_type("SKIP"), sample_type("KNOWN")],
    };
    let target = MockTarget {
        existing_sample_types: vec!["KNOWN".to_string()],
        ..MockTarget::default()
    };
    let orchestrator = SyncOrchestrator::new(source, target, engine());
    let result = orchestrator
        .transfer_sample_types(
            &HashSet::from(["SKIP".to_string()]),
            false,
            &RecordingSink::default(),
        )
        .unwrap();

    assert_eq!(result.created.len(), 1);
    assert_eq!(result.created[0].code, "KEEP");
    assert_eq!(result.existing, vec!["KNOWN".to_string()]);
    assert_eq!(result.blacklisted, vec!["SKIP".to_string()]);
}

#[test]
fn ignore_existing_recreates_known_sample_types() {
    let source = MockSource {
        graph: graph(),
        sample_types: vec![SampleType {
            code: "KNOWN".to_string(),
            property_assignments: Vec::new(),
        }],
    };
    let target = MockTarget {
        existing_sample_types: vec!["KNOWN".to_string()],
        ..MockTarget::default()
    };
    let orchestrator = SyncOrchestrator::new(source, target, engine());
    let result = orchestrator
        .transfer_sample_types(&HashSet::new(), true, &RecordingSink::default())
        .unwrap();

    assert_eq!(result.created.len(), 1);
    assert!(result.existing.is_empty());
    let created = orchestrator.target().created_sample_types.lock().unwrap();
    let titles = created[0]
        .attributes
        .iter()
        .map(|attribute| attribute.title.as_str())
        .collect::<Vec<_>>();
    assert_eq!(titles, vec!["openBIS Name", "Registration Date"]);
}
