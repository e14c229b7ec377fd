use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::domain::{Experiment, is_valid_code};
use crate::error::BridgeError;
use crate::openbis::SourceClient;
use crate::seek::TargetClient;
use crate::structure::{NodeWithQueuedAssets, TargetStructure};
use crate::translator::TranslationEngine;

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub transfer_data: bool,
    pub no_update: bool,
    pub dataset_blacklist: HashSet<String>,
    pub sample_blacklist: HashSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Created,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadedFile {
    pub dataset_code: String,
    pub file_path: String,
    pub location: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub experiment: String,
    pub perm_id: String,
    pub action: SyncAction,
    pub assay: String,
    pub samples: usize,
    pub assets: usize,
    pub uploaded: Vec<UploadedFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleTypeTransferResult {
    pub created: Vec<CreatedSampleType>,
    pub existing: Vec<String>,
    pub blacklisted: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedSampleType {
    pub code: String,
    pub id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpacesResult {
    pub spaces: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Searching,
    Creating,
    Updating(String),
    Streaming,
    Done,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Searching => f.write_str("Searching"),
            SyncState::Creating => f.write_str("Creating"),
            SyncState::Updating(id) => write!(f, "Updating({id})"),
            SyncState::Streaming => f.write_str("Streaming"),
            SyncState::Done => f.write_str("Done"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Drives one openBIS experiment into SEEK. It resolves and searches, translates, creates or
/// updates, then streams.
pub struct SyncOrchestrator<S: SourceClient, T: TargetClient> {
    source: S,
    target: T,
    engine: TranslationEngine,
}

impl<S: SourceClient, T: TargetClient> SyncOrchestrator<S, T> {
    pub fn new(source: S, target: T, engine: TranslationEngine) -> Self {
        Self {
            source,
            target,
            engine,
        }
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn sync_experiment(
        &self,
        id: &str,
        options: &SyncOptions,
        sink: &dyn ProgressSink,
    ) -> Result<SyncResult, BridgeError> {
        let started = Instant::now();
        sink.event(ProgressEvent {
            message: format!("phase=Resolve; {id}"),
            elapsed: None,
        });
        let experiment = self.resolve_experiment(id)?;

        let state = if options.no_update {
            SyncState::Creating
        } else {
            self.enter(SyncState::Searching, sink);
            self.search(&experiment.perm_id)?
        };

        let graph = self.source.experiment_with_descendants(&experiment.identifier)?;

        sink.event(ProgressEvent {
            message: format!(
                "phase=Translate; {} samples, {} datasets",
                graph.samples.len(),
                graph.datasets.len()
            ),
            elapsed: None,
        });
        let structure = self.engine.translate(
            &graph,
            &options.dataset_blacklist,
            &options.sample_blacklist,
            options.transfer_data,
        )?;
        self.enter(state.clone(), sink);

        let (action, node) = match state {
            SyncState::Updating(node_id) => (
                SyncAction::Updated,
                self.target
                    .update_node(&structure, &node_id, options.transfer_data)?,
            ),
            _ => (
                SyncAction::Created,
                self.target.create_node(&structure, options.transfer_data)?,
            ),
        };

        let uploaded = if options.transfer_data && !node.queued_assets.is_empty() {
            self.enter(SyncState::Streaming, sink);
            self.stream_assets(&node, sink)?
        } else {
            Vec::new()
        };

        self.enter(SyncState::Done, sink);
        sink.event(ProgressEvent {
            message: format!("phase=Done; {}", node.node_ref),
            elapsed: Some(started.elapsed()),
        });

        Ok(result_for(&experiment, action, &structure, node, uploaded))
    }

    /// Copies source sample types that SEEK does not know yet.
    pub fn transfer_sample_types(
        &self,
        blacklist: &HashSet<String>,
        ignore_existing: bool,
        sink: &dyn ProgressSink,
    ) -> Result<SampleTypeTransferResult, BridgeError> {
        let mut result = SampleTypeTransferResult {
            created: Vec::new(),
            existing: Vec::new(),
            blacklisted: Vec::new(),
        };

        for sample_type in self.source.sample_types()? {
            if blacklist.contains(&sample_type.code) {
                info!(sample_type = %sample_type.code, "skipping blacklisted sample type");
                result.blacklisted.push(sample_type.code);
                continue;
            }
            if !ignore_existing && self.target.sample_type_exists(&sample_type.code)? {
                info!(sample_type = %sample_type.code, "sample type already in SEEK");
                result.existing.push(sample_type.code);
                continue;
            }
            let translated = self.engine.translate_sample_type(&sample_type)?;
            let id = self.target.create_sample_type(&translated)?;
            sink.event(ProgressEvent {
                message: format!("phase=Create; sample type {} -> {id}", sample_type.code),
                elapsed: None,
            });
            result.created.push(CreatedSampleType {
                code: sample_type.code,
                id,
            });
        }

        Ok(result)
    }

    pub fn spaces(&self) -> Result<SpacesResult, BridgeError> {
        Ok(SpacesResult {
            spaces: self.source.list_spaces()?,
        })
    }

    fn resolve_experiment(&self, id: &str) -> Result<Experiment, BridgeError> {
        if let Some(experiment) = self.source.find_experiment(id)? {
            return Ok(experiment);
        }
        if self.source.find_sample(id)?.is_some() {
            return Err(BridgeError::UnsupportedObject {
                id: id.to_string(),
                kind: "sample".to_string(),
            });
        }
        if is_valid_code(id) && !self.source.find_datasets(&[id.to_string()])?.is_empty() {
            return Err(BridgeError::UnsupportedObject {
                id: id.to_string(),
                kind: "dataset".to_string(),
            });
        }
        Err(BridgeError::NotFound(id.to_string()))
    }

    fn search(&self, perm_id: &str) -> Result<SyncState, BridgeError> {
        let candidates = self.target.search_nodes_by_keyword(perm_id)?;
        match candidates.as_slice() {
            [] => Ok(SyncState::Creating),
            [node_id] => Ok(SyncState::Updating(node_id.clone())),
            _ => Err(BridgeError::AmbiguousMatch {
                keyword: perm_id.to_string(),
                candidates,
            }),
        }
    }

    fn stream_assets(
        &self,
        node: &NodeWithQueuedAssets,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<UploadedFile>, BridgeError> {
        let mut uploaded = Vec::with_capacity(node.queued_assets.len());
        for asset in &node.queued_assets {
            let started = Instant::now();
            let open = || self.source.stream_file(&asset.dataset_code, &asset.file_path);
            let location = match self.target.upload_blob(asset, &open) {
                Ok(location) => location,
                Err(err) => {
                    warn!(
                        file = %asset.file_path,
                        completed = uploaded.len(),
                        "upload failed; files uploaded so far remain in SEEK"
                    );
                    return Err(err);
                }
            };
            sink.event(ProgressEvent {
                message: format!("phase=Stream; {} -> {location}", asset.file_path),
                elapsed: Some(started.elapsed()),
            });
            uploaded.push(UploadedFile {
                dataset_code: asset.dataset_code.clone(),
                file_path: asset.file_path.clone(),
                location,
            });
        }
        Ok(uploaded)
    }

    fn enter(&self, state: SyncState, sink: &dyn ProgressSink) {
        info!(%state, "sync state");
        sink.event(ProgressEvent {
            message: format!("state={state}"),
            elapsed: None,
        });
    }
}

fn result_for(
    experiment: &Experiment,
    action: SyncAction,
    structure: &TargetStructure,
    node: NodeWithQueuedAssets,
    uploaded: Vec<UploadedFile>,
) -> SyncResult {
    SyncResult {
        experiment: experiment.identifier.clone(),
        perm_id: experiment.perm_id.clone(),
        action,
        assay: node.node_ref,
        samples: structure.sample_count(),
        assets: structure.assets().len(),
        uploaded,
    }
}
