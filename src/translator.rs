use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::config::{AttributeNames, ResolvedConfig};
use crate::domain::{DataKind, Dataset, DatasetFile, ExperimentGraph, Sample, SampleType};
use crate::error::BridgeError;
use crate::mapping::{MappingKind, TypeMappingRegistry};
use crate::structure::{
    Asset, Assay, AttributeKey, AttributeMap, AttributeValue, DatasetLink,
    SampleAttributeDefinition, TargetStructure, TranslatedSample, TranslatedSampleType,
};

const SAMPLE_ENTITY: &str = "SAMPLE";
const DATASET_ENTITY: &str = "DATA_SET";

/// Translates openBIS experiment graphs and sample types into their SEEK counterparts.
#[derive(Debug, Clone)]
pub struct TranslationEngine {
    registry: TypeMappingRegistry,
    openbis_base_url: String,
    attributes: AttributeNames,
    default_project: String,
    default_study: String,
}

impl TranslationEngine {
    pub fn new(registry: TypeMappingRegistry, config: &ResolvedConfig) -> Self {
        Self {
            registry,
            openbis_base_url: config.openbis.base_url.clone(),
            attributes: config.attributes.clone(),
            default_project: config.seek.default_project.clone(),
            default_study: config.seek.default_study.clone(),
        }
    }

    /// `<base>#entity=<ENTITY>&permId=<perm id>`, the openBIS UI deep link for an entity.
    pub fn deep_link(&self, entity: &str, perm_id: &str) -> String {
        format!("{}#entity={entity}&permId={perm_id}", self.openbis_base_url)
    }

    pub fn translate(
        &self,
        graph: &ExperimentGraph,
        dataset_blacklist: &HashSet<String>,
        sample_blacklist: &HashSet<String>,
        transfer_data: bool,
    ) -> Result<TargetStructure, BridgeError> {
        let experiment = &graph.experiment;
        let assay_type_uri = self
            .registry
            .resolve(MappingKind::AssayType, &experiment.type_code)?;
        let assay_class = self
            .registry
            .resolve(MappingKind::AssayClass, &experiment.type_code)?;

        let assay = Assay {
            title: format!("{} ({})", experiment.code, experiment.perm_id),
            assay_class: assay_class.to_string(),
            assay_type_uri: assay_type_uri.to_string(),
            study_id: self.default_study.clone(),
            project_id: self.default_project.clone(),
        };
        let mut structure = TargetStructure::new(assay, experiment.identifier.clone());

        for sample in &graph.samples {
            if sample_blacklist.contains(&sample.code) {
                info!(sample = %sample.code, "skipping blacklisted sample");
                continue;
            }
            let translated = self.translate_sample(sample);
            structure.add_sample(translated, sample.identifier.clone());
        }

        for dataset in &graph.datasets {
            if dataset_blacklist.contains(&dataset.perm_id) {
                info!(dataset = %dataset.perm_id, "skipping blacklisted dataset");
                continue;
            }
            for file in &dataset.files {
                if let Some(asset) = self.translate_file(dataset, file, transfer_data)? {
                    structure.add_asset(asset, file.clone());
                }
            }
        }

        debug!(
            experiment = %experiment.identifier,
            samples = structure.sample_count(),
            assets = structure.assets().len(),
            "translated experiment"
        );
        Ok(structure)
    }

    fn translate_sample(&self, sample: &Sample) -> TranslatedSample {
        let mut labels = HashMap::new();
        let mut sample_references = HashSet::new();
        for assignment in &sample.sample_type.property_assignments {
            labels.insert(assignment.code.as_str(), assignment.label.as_str());
            if assignment.data_kind.is_sample_reference() {
                sample_references.insert(assignment.code.as_str());
            }
        }

        let mut attributes = AttributeMap::new();
        for (code, value) in &sample.properties {
            let value = if sample_references.contains(code.as_str()) {
                AttributeValue::Link(self.deep_link(SAMPLE_ENTITY, value))
            } else {
                AttributeValue::Text(value.clone())
            };
            let label = labels.get(code.as_str()).copied().unwrap_or(code.as_str());
            attributes.insert(AttributeKey::new(label), value);
        }

        attributes.insert(
            AttributeKey::new(self.attributes.sample_title.clone()),
            AttributeValue::Text(sample.identifier.clone()),
        );
        attributes.insert(
            AttributeKey::new(self.attributes.registration_date.clone()),
            AttributeValue::Date(sample.registration_date.date_naive()),
        );

        TranslatedSample {
            title: sample.identifier.clone(),
            sample_type_code: sample.sample_type.code.clone(),
            attributes,
            project_id: self.default_project.clone(),
        }
    }

    fn translate_file(
        &self,
        dataset: &Dataset,
        file: &DatasetFile,
        transfer_data: bool,
    ) -> Result<Option<Asset>, BridgeError> {
        if file.path.trim().is_empty() || file.is_directory {
            return Ok(None);
        }

        let asset_type = self
            .registry
            .resolve(MappingKind::AssetType, &dataset.type_code)?;
        let file_name = file.file_name();
        let link = self.deep_link(DATASET_ENTITY, &file.dataset_perm_id);
        let dataset_link = if transfer_data {
            DatasetLink::Download(link)
        } else {
            DatasetLink::ReferenceOnly(link)
        };
        let format_annotations = self
            .registry
            .format_annotation(file_name)
            .map(|annotation| vec![annotation.to_string()])
            .unwrap_or_default();

        Ok(Some(Asset {
            name: format!("{}: {file_name}", file.dataset_perm_id),
            asset_type: asset_type.to_string(),
            file_name: file_name.to_string(),
            file_length: file.file_length,
            dataset_link,
            format_annotations,
            project_id: self.default_project.clone(),
        }))
    }

    /// Builds a SEEK sample type mirroring an openBIS one, including the two attributes every
    /// translated sample carries.
    pub fn translate_sample_type(
        &self,
        sample_type: &SampleType,
    ) -> Result<TranslatedSampleType, BridgeError> {
        let mut attributes = vec![
            SampleAttributeDefinition {
                title: self.attributes.sample_title.clone(),
                attribute_type_id: self.registry.attribute_type(DataKind::Varchar)?.id.clone(),
                required: true,
                is_title: true,
            },
            SampleAttributeDefinition {
                title: self.attributes.registration_date.clone(),
                attribute_type_id: self.registry.attribute_type(DataKind::Date)?.id.clone(),
                required: false,
                is_title: false,
            },
        ];
        for assignment in &sample_type.property_assignments {
            attributes.push(SampleAttributeDefinition {
                title: assignment.label.clone(),
                attribute_type_id: self
                    .registry
                    .attribute_type(assignment.data_kind)?
                    .id
                    .clone(),
                required: false,
                is_title: false,
            });
        }

        Ok(TranslatedSampleType {
            title: sample_type.code.clone(),
            attributes,
            project_id: self.default_project.clone(),
        })
    }
}
