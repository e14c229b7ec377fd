use std::collections::HashMap;
use std::io::Read;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use reqwest::Method;
use reqwest::blocking::{Body, Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::config::SeekSettings;
use crate::error::BridgeError;
use crate::structure::{
    Asset, NodeWithQueuedAssets, QueuedAsset, SourcedAsset, TargetStructure, TranslatedSample,
    TranslatedSampleType,
};

const SERVICE: &str = "SEEK";
const JSON_API: &str = "application/vnd.api+json";

/// Opens a fresh source stream for one upload.
pub type StreamOpener<'a> = &'a dyn Fn() -> Result<Box<dyn Read + Send>, BridgeError>;

/// Write access to the SEEK instance receiving the translated structure.
pub trait TargetClient: Send + Sync {
    /// Ids of assays mentioning `keyword`. Also makes sure the sample type table needed to
    /// create samples is available.
    fn search_nodes_by_keyword(&self, keyword: &str) -> Result<Vec<String>, BridgeError>;
    fn create_node(
        &self,
        structure: &TargetStructure,
        transfer_data: bool,
    ) -> Result<NodeWithQueuedAssets, BridgeError>;
    fn update_node(
        &self,
        structure: &TargetStructure,
        node_id: &str,
        transfer_data: bool,
    ) -> Result<NodeWithQueuedAssets, BridgeError>;
    /// Streams the content of one queued asset into its blob and returns the download location.
    fn upload_blob(
        &self,
        asset: &QueuedAsset,
        open: StreamOpener<'_>,
    ) -> Result<String, BridgeError>;
    fn sample_type_exists(&self, code: &str) -> Result<bool, BridgeError>;
    fn create_sample_type(&self, sample_type: &TranslatedSampleType) -> Result<String, BridgeError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub id: String,
    pub title: Option<String>,
}

/// What an update does with one translated sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleAction {
    Create,
    Patch(String),
}

pub struct SeekHttpClient {
    client: Client,
    base_url: String,
    user: String,
    password: String,
    sample_types: Mutex<Option<HashMap<String, String>>>,
}

impl SeekHttpClient {
    pub fn new(settings: &SeekSettings, password: &str) -> Result<Self, BridgeError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("obs-bridge/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| BridgeError::SeekHttp(err.to_string()))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static(JSON_API));
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .timeout(None)
            .build()
            .map_err(|err| BridgeError::SeekHttp(err.to_string()))?;

        Ok(Self {
            client,
            base_url: settings.url.trim_end_matches('/').to_string(),
            user: settings.user.clone(),
            password: password.to_string(),
            sample_types: Mutex::new(None),
        })
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        debug!(%method, url, "SEEK request");
        self.client
            .request(method, url)
            .basic_auth(&self.user, Some(&self.password))
    }

    fn handle_status(response: Response) -> Result<Response, BridgeError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "SEEK request failed".to_string());
        Err(BridgeError::SeekStatus { status, message })
    }

    fn send_json(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, BridgeError> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self.request(method, &url);
        if let Some(body) = body {
            let payload = serde_json::to_vec(body)
                .map_err(|err| BridgeError::SeekHttp(err.to_string()))?;
            request = request.header(CONTENT_TYPE, JSON_API).body(payload);
        }
        let response = request
            .send()
            .map_err(|err| BridgeError::SeekHttp(err.to_string()))?;
        Self::handle_status(response)?
            .json()
            .map_err(|err| BridgeError::malformed(SERVICE, err.to_string()))
    }

    fn search(&self, query: &str, search_type: &str) -> Result<Vec<SearchHit>, BridgeError> {
        let url = format!("{}/search", self.base_url);
        let response = self
            .request(Method::GET, &url)
            .query(&[("q", query), ("search_type", search_type)])
            .send()
            .map_err(|err| BridgeError::SeekHttp(err.to_string()))?;
        let payload: Value = Self::handle_status(response)?
            .json()
            .map_err(|err| BridgeError::malformed(SERVICE, err.to_string()))?;
        parse_search_hits(&payload)
    }

    /// Sample type title to id, fetched once per client.
    fn sample_type_ids(&self) -> Result<HashMap<String, String>, BridgeError> {
        let mut cache = self
            .sample_types
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(table) = cache.as_ref() {
            return Ok(table.clone());
        }
        let payload = self.send_json(Method::GET, "/sample_types", None)?;
        let table = parse_sample_type_table(&payload)?;
        debug!(sample_types = table.len(), "loaded SEEK sample types");
        *cache = Some(table.clone());
        Ok(table)
    }

    fn sample_type_id(&self, code: &str) -> Result<String, BridgeError> {
        self.sample_type_ids()?
            .remove(code)
            .ok_or_else(|| BridgeError::unmapped("SEEK sample type", code))
    }

    fn create_sample(&self, sample: &TranslatedSample) -> Result<String, BridgeError> {
        let type_id = self.sample_type_id(&sample.sample_type_code)?;
        let response = self.send_json(
            Method::POST,
            "/samples",
            Some(&sample_body(sample, &type_id, None)),
        )?;
        created_id(&response)
    }

    fn create_asset(
        &self,
        asset: &SourcedAsset,
        assay_id: &str,
        transfer_data: bool,
    ) -> Result<Option<QueuedAsset>, BridgeError> {
        let response = self.send_json(
            Method::POST,
            &format!("/{}", asset.asset.asset_type),
            Some(&asset_body(&asset.asset, assay_id)),
        )?;
        if !(transfer_data && asset.asset.dataset_link.transfers_data()) {
            return Ok(None);
        }
        Ok(Some(QueuedAsset {
            blob_endpoint: blob_endpoint(&response)?,
            dataset_code: asset.file.dataset_perm_id.clone(),
            file_path: asset.file.path.clone(),
            file_length: asset.file.file_length,
        }))
    }

    fn node_ref(&self, assay_id: &str) -> String {
        format!("{}/assays/{assay_id}", self.base_url)
    }
}

impl TargetClient for SeekHttpClient {
    fn search_nodes_by_keyword(&self, keyword: &str) -> Result<Vec<String>, BridgeError> {
        self.sample_type_ids()?;
        Ok(self
            .search(keyword, "assays")?
            .into_iter()
            .map(|hit| hit.id)
            .collect())
    }

    fn create_node(
        &self,
        structure: &TargetStructure,
        transfer_data: bool,
    ) -> Result<NodeWithQueuedAssets, BridgeError> {
        let sample_ids = structure
            .samples()
            .map(|(_, sample)| self.create_sample(sample))
            .collect::<Result<Vec<_>, _>>()?;

        let response = self.send_json(
            Method::POST,
            "/assays",
            Some(&assay_body(structure, &sample_ids, None)),
        )?;
        let assay_id = created_id(&response)?;
        info!(assay = %assay_id, samples = sample_ids.len(), "created SEEK assay");

        let mut queued_assets = Vec::new();
        for asset in structure.assets() {
            if let Some(queued) = self.create_asset(asset, &assay_id, transfer_data)? {
                queued_assets.push(queued);
            }
        }

        Ok(NodeWithQueuedAssets {
            node_ref: self.node_ref(&assay_id),
            queued_assets,
        })
    }

    fn update_node(
        &self,
        structure: &TargetStructure,
        node_id: &str,
        transfer_data: bool,
    ) -> Result<NodeWithQueuedAssets, BridgeError> {
        let mut sample_ids = Vec::with_capacity(structure.sample_count());
        for (identifier, sample) in structure.samples() {
            let hits = self.search(identifier, "samples")?;
            match sample_action(hits, identifier, &sample.title)? {
                SampleAction::Create => sample_ids.push(self.create_sample(sample)?),
                SampleAction::Patch(existing) => {
                    let type_id = self.sample_type_id(&sample.sample_type_code)?;
                    self.send_json(
                        Method::PATCH,
                        &format!("/samples/{existing}"),
                        Some(&sample_body(sample, &type_id, Some(existing.as_str()))),
                    )?;
                    sample_ids.push(existing);
                }
            }
        }

        self.send_json(
            Method::PATCH,
            &format!("/assays/{node_id}"),
            Some(&assay_body(structure, &sample_ids, Some(node_id))),
        )?;
        info!(assay = node_id, samples = sample_ids.len(), "updated SEEK assay");

        let mut queued_assets = Vec::new();
        for asset in structure.assets() {
            let hits = self.search(&asset.asset.name, &asset.asset.asset_type)?;
            if asset_present(hits, &asset.asset.name) {
                debug!(asset = %asset.asset.name, "asset already present");
                continue;
            }
            if let Some(queued) = self.create_asset(asset, node_id, transfer_data)? {
                queued_assets.push(queued);
            }
        }

        Ok(NodeWithQueuedAssets {
            node_ref: self.node_ref(node_id),
            queued_assets,
        })
    }

    fn upload_blob(
        &self,
        asset: &QueuedAsset,
        open: StreamOpener<'_>,
    ) -> Result<String, BridgeError> {
        let reader = open()?;
        let response = self
            .request(Method::PUT, &asset.blob_endpoint)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(Body::sized(reader, asset.file_length))
            .send()
            .map_err(|err| BridgeError::SeekHttp(err.to_string()))?;
        Self::handle_status(response)?;
        Ok(format!("{}/download", asset.blob_endpoint))
    }

    fn sample_type_exists(&self, code: &str) -> Result<bool, BridgeError> {
        Ok(self.sample_type_ids()?.contains_key(code))
    }

    fn create_sample_type(
        &self,
        sample_type: &TranslatedSampleType,
    ) -> Result<String, BridgeError> {
        let response = self.send_json(
            Method::POST,
            "/sample_types",
            Some(&sample_type_body(sample_type)),
        )?;
        let id = created_id(&response)?;
        if let Some(table) = self
            .sample_types
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            table.insert(sample_type.title.clone(), id.clone());
        }
        Ok(id)
    }
}

fn relationship(id: &str, kind: &str) -> Value {
    json!({ "data": { "id": id, "type": kind } })
}

fn relationships(ids: &[String], kind: &str) -> Value {
    let data = ids
        .iter()
        .map(|id| json!({ "id": id, "type": kind }))
        .collect::<Vec<_>>();
    json!({ "data": data })
}

fn with_id(mut data: Value, id: Option<&str>) -> Value {
    if let (Some(id), Some(object)) = (id, data.as_object_mut()) {
        object.insert("id".to_string(), json!(id));
    }
    json!({ "data": data })
}

pub fn assay_body(structure: &TargetStructure, sample_ids: &[String], id: Option<&str>) -> Value {
    let assay = structure.assay();
    let data = json!({
        "type": "assays",
        "attributes": {
            "title": assay.title,
            "description": format!("openBIS experiment {}", structure.source_reference()),
            "assay_class": { "key": assay.assay_class },
            "assay_type": { "uri": assay.assay_type_uri },
            "policy": { "access": "no_access" },
        },
        "relationships": {
            "study": relationship(&assay.study_id, "studies"),
            "samples": relationships(sample_ids, "samples"),
        },
    });
    with_id(data, id)
}

pub fn sample_body(sample: &TranslatedSample, sample_type_id: &str, id: Option<&str>) -> Value {
    let attribute_map = sample
        .attributes
        .iter()
        .map(|(key, value)| (key.to_string(), json!(value.render())))
        .collect::<Map<_, _>>();
    let data = json!({
        "type": "samples",
        "attributes": {
            "attribute_map": attribute_map,
            "policy": { "access": "no_access" },
        },
        "relationships": {
            "projects": relationships(&[sample.project_id.clone()], "projects"),
            "sample_type": relationship(sample_type_id, "sample_types"),
        },
    });
    with_id(data, id)
}

pub fn asset_body(asset: &Asset, assay_id: &str) -> Value {
    let link = asset.dataset_link.url();
    let blob = if asset.dataset_link.transfers_data() {
        json!({ "original_filename": asset.file_name, "content_type": "application/octet-stream" })
    } else {
        json!({ "original_filename": asset.file_name, "content_type": "text/html", "url": link })
    };
    json!({
        "data": {
            "type": asset.asset_type,
            "attributes": {
                "title": asset.name,
                "description": format!("openBIS dataset: {link}"),
                "content_blobs": [blob],
                "data_format_annotations": asset.format_annotations,
                "policy": { "access": "no_access" },
            },
            "relationships": {
                "projects": relationships(&[asset.project_id.clone()], "projects"),
                "assays": relationships(&[assay_id.to_string()], "assays"),
            },
        }
    })
}

pub fn sample_type_body(sample_type: &TranslatedSampleType) -> Value {
    let attributes = sample_type
        .attributes
        .iter()
        .map(|attribute| {
            json!({
                "title": attribute.title,
                "sample_attribute_type": { "id": attribute.attribute_type_id },
                "required": attribute.required,
                "is_title": attribute.is_title,
            })
        })
        .collect::<Vec<_>>();
    json!({
        "data": {
            "type": "sample_types",
            "attributes": {
                "title": sample_type.title,
                "sample_attributes": attributes,
            },
            "relationships": {
                "projects": relationships(&[sample_type.project_id.clone()], "projects"),
            },
        }
    })
}

fn data_array(payload: &Value) -> Result<&Vec<Value>, BridgeError> {
    payload
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| BridgeError::malformed(SERVICE, "response without data list"))
}

fn id_of(value: &Value) -> Option<String> {
    match value.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

pub fn parse_search_hits(payload: &Value) -> Result<Vec<SearchHit>, BridgeError> {
    data_array(payload)?
        .iter()
        .map(|item| -> Result<SearchHit, BridgeError> {
            Ok(SearchHit {
                id: id_of(item)
                    .ok_or_else(|| BridgeError::malformed(SERVICE, "search hit without id"))?,
                title: item
                    .pointer("/attributes/title")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
        })
        .collect()
}

pub fn parse_sample_type_table(payload: &Value) -> Result<HashMap<String, String>, BridgeError> {
    data_array(payload)?
        .iter()
        .map(|item| -> Result<(String, String), BridgeError> {
            let id = id_of(item)
                .ok_or_else(|| BridgeError::malformed(SERVICE, "sample type without id"))?;
            let title = item
                .pointer("/attributes/title")
                .and_then(Value::as_str)
                .ok_or_else(|| BridgeError::malformed(SERVICE, "sample type without title"))?;
            Ok((title.to_string(), id))
        })
        .collect()
}

fn created_id(response: &Value) -> Result<String, BridgeError> {
    response
        .get("data")
        .and_then(id_of)
        .ok_or_else(|| BridgeError::malformed(SERVICE, "created resource without id"))
}

pub fn blob_endpoint(response: &Value) -> Result<String, BridgeError> {
    response
        .pointer("/data/attributes/content_blobs/0/link")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BridgeError::malformed(SERVICE, "asset without content blob link"))
}

/// Hits whose title equals `title`. Hits without a title count as matches, since the search
/// already matched them on the keyword.
fn exact_title_matches(hits: Vec<SearchHit>, title: &str) -> Vec<String> {
    hits.into_iter()
        .filter(|hit| hit.title.as_deref().is_none_or(|hit_title| hit_title == title))
        .map(|hit| hit.id)
        .collect()
}

/// Decides how an update treats a sample from the hits of a search on its source identifier.
pub fn sample_action(
    hits: Vec<SearchHit>,
    identifier: &str,
    title: &str,
) -> Result<SampleAction, BridgeError> {
    let mut matches = exact_title_matches(hits, title);
    match matches.len() {
        0 => Ok(SampleAction::Create),
        1 => Ok(SampleAction::Patch(matches.remove(0))),
        _ => Err(BridgeError::AmbiguousMatch {
            keyword: identifier.to_string(),
            candidates: matches,
        }),
    }
}

/// True when SEEK already holds an asset titled `title`.
pub fn asset_present(hits: Vec<SearchHit>, title: &str) -> bool {
    !exact_title_matches(hits, title).is_empty()
}
