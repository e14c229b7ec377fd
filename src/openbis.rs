use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Url;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::{Value, json};
use tracing::debug;

use crate::config::OpenbisSettings;
use crate::domain::{
    DataKind, Dataset, DatasetFile, DatasetSummary, Experiment, ExperimentGraph,
    PropertyAssignment, Sample, SampleSummary, SampleType,
};
use crate::error::BridgeError;

const SERVICE: &str = "openBIS";
const AS_API_PATH: &str = "/openbis/openbis/rmi-application-server-v3.json";
const DSS_API_PATH: &str = "/datastore_server/rmi-data-store-server-v3.json";

/// Read-only access to the openBIS instance the data comes from.
pub trait SourceClient: Send + Sync {
    fn list_spaces(&self) -> Result<Vec<String>, BridgeError>;
    fn find_experiment(&self, id: &str) -> Result<Option<Experiment>, BridgeError>;
    fn find_sample(&self, id: &str) -> Result<Option<SampleSummary>, BridgeError>;
    fn find_datasets(&self, codes: &[String]) -> Result<Vec<DatasetSummary>, BridgeError>;
    fn experiment_with_descendants(&self, id: &str) -> Result<ExperimentGraph, BridgeError>;
    fn sample_types(&self) -> Result<Vec<SampleType>, BridgeError>;
    /// Opens the content of one dataset file. The caller owns the stream and must drop it
    /// before opening the next one.
    fn stream_file(
        &self,
        dataset_code: &str,
        path: &str,
    ) -> Result<Box<dyn Read + Send>, BridgeError>;
}

#[derive(Clone)]
pub struct OpenbisHttpClient {
    client: Client,
    as_endpoint: String,
    dss_endpoint: String,
    dss_url: String,
    session_token: String,
}

impl OpenbisHttpClient {
    /// Logs in with the configured user and keeps the session token for all later calls.
    pub fn connect(settings: &OpenbisSettings, password: &str) -> Result<Self, BridgeError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("obs-bridge/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| BridgeError::OpenbisHttp(err.to_string()))?,
        );
        // File downloads can take arbitrarily long, so only connecting is bounded.
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .timeout(None)
            .build()
            .map_err(|err| BridgeError::OpenbisHttp(err.to_string()))?;

        let mut connector = Self {
            client,
            as_endpoint: format!("{}{AS_API_PATH}", settings.as_url.trim_end_matches('/')),
            dss_endpoint: format!("{}{DSS_API_PATH}", settings.dss_url.trim_end_matches('/')),
            dss_url: settings.dss_url.trim_end_matches('/').to_string(),
            session_token: String::new(),
        };

        let token = connector.call(
            &connector.as_endpoint,
            "login",
            vec![json!(settings.user), json!(password)],
        )?;
        connector.session_token = token
            .as_str()
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .ok_or_else(|| BridgeError::OpenbisRpc {
                method: "login".to_string(),
                message: format!("login failed for user {}", settings.user),
            })?;
        debug!(user = %settings.user, "logged in to openBIS");
        Ok(connector)
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, BridgeError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "openBIS request failed".to_string());
        Err(BridgeError::OpenbisStatus { status, message })
    }

    fn call(&self, endpoint: &str, method: &str, params: Vec<Value>) -> Result<Value, BridgeError> {
        debug!(method, endpoint, "openBIS call");
        let body = json!({
            "id": "1",
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        let response = self
            .client
            .post(endpoint)
            .json(&body)
            .send()
            .map_err(|err| BridgeError::OpenbisHttp(err.to_string()))?;
        let response = Self::handle_status(response)?;
        let payload: Value = response
            .json()
            .map_err(|err| BridgeError::malformed(SERVICE, err.to_string()))?;
        rpc_result(method, payload)
    }

    fn as_call(&self, method: &str, mut params: Vec<Value>) -> Result<Value, BridgeError> {
        params.insert(0, json!(self.session_token));
        self.call(&self.as_endpoint, method, params)
    }

    fn dataset_files(&self, dataset_code: &str) -> Result<Vec<DatasetFile>, BridgeError> {
        let criteria = json!({
            "@type": "dss.dto.datasetfile.search.DataSetFileSearchCriteria",
            "operator": "AND",
            "criteria": [{
                "@type": "as.dto.dataset.search.DataSetSearchCriteria",
                "relation": "DATASET",
                "operator": "AND",
                "criteria": [perm_id_criteria(dataset_code)],
            }],
        });
        let fetch = json!({ "@type": "dss.dto.datasetfile.fetchoptions.DataSetFileFetchOptions" });
        let result = self.call(
            &self.dss_endpoint,
            "searchFiles",
            vec![json!(self.session_token), criteria, fetch],
        )?;
        parse_dataset_files(&result)
    }
}

impl SourceClient for OpenbisHttpClient {
    fn list_spaces(&self) -> Result<Vec<String>, BridgeError> {
        let result = self.as_call(
            "searchSpaces",
            vec![
                json!({ "@type": "as.dto.space.search.SpaceSearchCriteria" }),
                json!({ "@type": "as.dto.space.fetchoptions.SpaceFetchOptions" }),
            ],
        )?;
        search_objects(&result)?
            .iter()
            .map(|space| str_field(space, "code"))
            .collect()
    }

    fn find_experiment(&self, id: &str) -> Result<Option<Experiment>, BridgeError> {
        let fetch = json!({
            "@type": "as.dto.experiment.fetchoptions.ExperimentFetchOptions",
            "type": { "@type": "as.dto.experiment.fetchoptions.ExperimentTypeFetchOptions" },
        });
        let result = self.as_call("getExperiments", vec![json!([experiment_id(id)]), fetch])?;
        let index = ObjectIndex::build(&result);
        first_map_value(&result)
            .map(|value| parse_experiment(&index, value))
            .transpose()
    }

    fn find_sample(&self, id: &str) -> Result<Option<SampleSummary>, BridgeError> {
        let fetch = json!({
            "@type": "as.dto.sample.fetchoptions.SampleFetchOptions",
            "type": { "@type": "as.dto.sample.fetchoptions.SampleTypeFetchOptions" },
        });
        let result = self.as_call("getSamples", vec![json!([sample_id(id)]), fetch])?;
        let index = ObjectIndex::build(&result);
        first_map_value(&result)
            .map(|value| -> Result<SampleSummary, BridgeError> {
                Ok(SampleSummary {
                    identifier: nested_str(&index, value, "identifier", "identifier")?,
                    perm_id: nested_str(&index, value, "permId", "permId")?,
                    type_code: nested_str(&index, value, "type", "code")?,
                })
            })
            .transpose()
    }

    fn find_datasets(&self, codes: &[String]) -> Result<Vec<DatasetSummary>, BridgeError> {
        if codes.is_empty() {
            return Ok(Vec::new());
        }
        let ids = codes
            .iter()
            .map(|code| json!({ "@type": "as.dto.dataset.id.DataSetPermId", "permId": code }))
            .collect::<Vec<_>>();
        let fetch = json!({
            "@type": "as.dto.dataset.fetchoptions.DataSetFetchOptions",
            "type": { "@type": "as.dto.dataset.fetchoptions.DataSetTypeFetchOptions" },
        });
        let result = self.as_call("getDataSets", vec![json!(ids), fetch])?;
        let index = ObjectIndex::build(&result);
        let Some(map) = result.as_object() else {
            return Err(BridgeError::malformed(SERVICE, "getDataSets did not return a map"));
        };
        map.values()
            .filter_map(|value| index.resolve(value))
            .map(|value| -> Result<DatasetSummary, BridgeError> {
                Ok(DatasetSummary {
                    code: str_field(value, "code")?,
                    type_code: nested_str(&index, value, "type", "code")?,
                })
            })
            .collect()
    }

    fn experiment_with_descendants(&self, id: &str) -> Result<ExperimentGraph, BridgeError> {
        let result = self.as_call(
            "getExperiments",
            vec![json!([experiment_id(id)]), experiment_with_descendants_fetch()],
        )?;
        let (experiment, samples, dataset_stubs) = parse_experiment_graph(&result)
            .and_then(|graph| graph.ok_or_else(|| BridgeError::NotFound(id.to_string())))?;

        let mut datasets = Vec::with_capacity(dataset_stubs.len());
        for (perm_id, type_code) in dataset_stubs {
            let files = self.dataset_files(&perm_id)?;
            datasets.push(Dataset {
                perm_id,
                type_code,
                files,
            });
        }

        Ok(ExperimentGraph {
            experiment,
            samples,
            datasets,
        })
    }

    fn sample_types(&self) -> Result<Vec<SampleType>, BridgeError> {
        let result = self.as_call(
            "searchSampleTypes",
            vec![
                json!({ "@type": "as.dto.sample.search.SampleTypeSearchCriteria" }),
                sample_type_fetch(),
            ],
        )?;
        let index = ObjectIndex::build(&result);
        search_objects(&result)?
            .iter()
            .filter_map(|value| index.resolve(value))
            .map(|value| parse_sample_type(&index, value))
            .collect()
    }

    fn stream_file(
        &self,
        dataset_code: &str,
        path: &str,
    ) -> Result<Box<dyn Read + Send>, BridgeError> {
        let url = file_download_url(&self.dss_url, dataset_code, path, &self.session_token)?;
        debug!(dataset = dataset_code, path, "opening openBIS file stream");
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| BridgeError::OpenbisHttp(err.to_string()))?;
        let response = Self::handle_status(response)?;
        Ok(Box::new(response))
    }
}

fn rpc_result(method: &str, mut payload: Value) -> Result<Value, BridgeError> {
    if let Some(error) = payload.get("error").filter(|error| !error.is_null()) {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Err(BridgeError::OpenbisRpc {
            method: method.to_string(),
            message,
        });
    }
    Ok(payload
        .get_mut("result")
        .map(Value::take)
        .unwrap_or(Value::Null))
}

/// `<dss>/datastore_server/<dataset>/<path>?sessionID=<token>` with every segment escaped.
pub fn file_download_url(
    dss_url: &str,
    dataset_code: &str,
    path: &str,
    session_token: &str,
) -> Result<Url, BridgeError> {
    let mut url = Url::parse(&format!("{}/datastore_server", dss_url.trim_end_matches('/')))
        .map_err(|err| BridgeError::OpenbisHttp(format!("invalid data store URL: {err}")))?;
    url.path_segments_mut()
        .map_err(|_| BridgeError::OpenbisHttp("data store URL cannot be a base".to_string()))?
        .push(dataset_code)
        .extend(path.split('/').filter(|segment| !segment.is_empty()));
    url.query_pairs_mut().append_pair("sessionID", session_token);
    Ok(url)
}

fn experiment_id(id: &str) -> Value {
    if id.starts_with('/') {
        json!({ "@type": "as.dto.experiment.id.ExperimentIdentifier", "identifier": id })
    } else {
        json!({ "@type": "as.dto.experiment.id.ExperimentPermId", "permId": id })
    }
}

fn sample_id(id: &str) -> Value {
    if id.starts_with('/') {
        json!({ "@type": "as.dto.sample.id.SampleIdentifier", "identifier": id })
    } else {
        json!({ "@type": "as.dto.sample.id.SamplePermId", "permId": id })
    }
}

fn perm_id_criteria(perm_id: &str) -> Value {
    json!({
        "@type": "as.dto.common.search.PermIdSearchCriteria",
        "fieldValue": { "@type": "as.dto.common.search.StringEqualToValue", "value": perm_id },
    })
}

fn sample_type_fetch() -> Value {
    json!({
        "@type": "as.dto.sample.fetchoptions.SampleTypeFetchOptions",
        "propertyAssignments": {
            "@type": "as.dto.property.fetchoptions.PropertyAssignmentFetchOptions",
            "propertyType": { "@type": "as.dto.property.fetchoptions.PropertyTypeFetchOptions" },
        },
    })
}

fn experiment_with_descendants_fetch() -> Value {
    json!({
        "@type": "as.dto.experiment.fetchoptions.ExperimentFetchOptions",
        "type": { "@type": "as.dto.experiment.fetchoptions.ExperimentTypeFetchOptions" },
        "samples": {
            "@type": "as.dto.sample.fetchoptions.SampleFetchOptions",
            "type": sample_type_fetch(),
            "properties": { "@type": "as.dto.property.fetchoptions.PropertyFetchOptions" },
        },
        "dataSets": {
            "@type": "as.dto.dataset.fetchoptions.DataSetFetchOptions",
            "type": { "@type": "as.dto.dataset.fetchoptions.DataSetTypeFetchOptions" },
        },
    })
}

/// openBIS serializes repeated objects once and refers back to them by their numeric `@id`.
struct ObjectIndex<'a> {
    by_id: HashMap<u64, &'a Value>,
}

impl<'a> ObjectIndex<'a> {
    fn build(root: &'a Value) -> Self {
        let mut by_id = HashMap::new();
        let mut pending = vec![root];
        while let Some(value) = pending.pop() {
            match value {
                Value::Object(map) => {
                    if let Some(id) = map.get("@id").and_then(Value::as_u64) {
                        by_id.insert(id, value);
                    }
                    pending.extend(map.values());
                }
                Value::Array(items) => pending.extend(items),
                _ => {}
            }
        }
        Self { by_id }
    }

    fn resolve(&self, value: &'a Value) -> Option<&'a Value> {
        match value {
            Value::Object(_) => Some(value),
            Value::Number(number) => number.as_u64().and_then(|id| self.by_id.get(&id).copied()),
            _ => None,
        }
    }

    fn field(&self, value: &'a Value, key: &str) -> Option<&'a Value> {
        value.get(key).and_then(|field| self.resolve(field))
    }

    fn list(&self, value: &'a Value, key: &str) -> Vec<&'a Value> {
        value
            .get(key)
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(|item| self.resolve(item)).collect())
            .unwrap_or_default()
    }
}

fn str_field(value: &Value, key: &str) -> Result<String, BridgeError> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BridgeError::malformed(SERVICE, format!("missing field {key}")))
}

fn nested_str(
    index: &ObjectIndex<'_>,
    value: &Value,
    outer: &str,
    inner: &str,
) -> Result<String, BridgeError> {
    index
        .field(value, outer)
        .ok_or_else(|| BridgeError::malformed(SERVICE, format!("missing field {outer}")))
        .and_then(|nested| str_field(nested, inner))
}

fn search_objects(result: &Value) -> Result<&Vec<Value>, BridgeError> {
    result
        .get("objects")
        .and_then(Value::as_array)
        .ok_or_else(|| BridgeError::malformed(SERVICE, "search result without objects"))
}

/// `get*` methods answer with a map keyed by the requested id.
fn first_map_value(result: &Value) -> Option<&Value> {
    result
        .as_object()
        .and_then(|map| map.values().next())
        .filter(|value| !value.is_null())
}

fn parse_experiment(index: &ObjectIndex<'_>, value: &Value) -> Result<Experiment, BridgeError> {
    Ok(Experiment {
        code: str_field(value, "code")?,
        perm_id: nested_str(index, value, "permId", "permId")?,
        type_code: nested_str(index, value, "type", "code")?,
        identifier: nested_str(index, value, "identifier", "identifier")?,
    })
}

fn parse_sample_type(index: &ObjectIndex<'_>, value: &Value) -> Result<SampleType, BridgeError> {
    let property_assignments = index
        .list(value, "propertyAssignments")
        .into_iter()
        .map(|assignment| -> Result<PropertyAssignment, BridgeError> {
            let property_type = index
                .field(assignment, "propertyType")
                .ok_or_else(|| BridgeError::malformed(SERVICE, "assignment without propertyType"))?;
            let data_kind: DataKind = str_field(property_type, "dataType")?.parse()?;
            Ok(PropertyAssignment {
                code: str_field(property_type, "code")?,
                label: str_field(property_type, "label")?,
                data_kind,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(SampleType {
        code: str_field(value, "code")?,
        property_assignments,
    })
}

fn parse_sample(index: &ObjectIndex<'_>, value: &Value) -> Result<Sample, BridgeError> {
    let sample_type = index
        .field(value, "type")
        .ok_or_else(|| BridgeError::malformed(SERVICE, "sample without type"))
        .and_then(|sample_type| parse_sample_type(index, sample_type))?;

    let properties = value
        .get("properties")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter(|(_, value)| !value.is_null())
                .map(|(code, value)| {
                    let text = match value {
                        Value::String(text) => text.clone(),
                        other => other.to_string(),
                    };
                    (code.clone(), text)
                })
                .collect::<BTreeMap<_, _>>()
        })
        .unwrap_or_default();

    let registration_date = value
        .get("registrationDate")
        .and_then(Value::as_i64)
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .ok_or_else(|| BridgeError::malformed(SERVICE, "sample without registrationDate"))?;

    Ok(Sample {
        code: str_field(value, "code")?,
        identifier: nested_str(index, value, "identifier", "identifier")?,
        sample_type,
        properties,
        registration_date,
    })
}

type ParsedGraph = (Experiment, Vec<Sample>, Vec<(String, String)>);

/// Experiment, samples and `(perm id, type code)` of each dataset from a `getExperiments` result.
fn parse_experiment_graph(result: &Value) -> Result<Option<ParsedGraph>, BridgeError> {
    let index = ObjectIndex::build(result);
    let Some(value) = first_map_value(result).and_then(|value| index.resolve(value)) else {
        return Ok(None);
    };
    let experiment = parse_experiment(&index, value)?;
    let samples = index
        .list(value, "samples")
        .into_iter()
        .map(|sample| parse_sample(&index, sample))
        .collect::<Result<Vec<_>, _>>()?;
    let datasets = index
        .list(value, "dataSets")
        .into_iter()
        .map(|dataset| -> Result<(String, String), BridgeError> {
            Ok((
                nested_str(&index, dataset, "permId", "permId")?,
                nested_str(&index, dataset, "type", "code")?,
            ))
        })
        .collect::<Result<Vec<_>, BridgeError>>()?;
    Ok(Some((experiment, samples, datasets)))
}

fn parse_dataset_files(result: &Value) -> Result<Vec<DatasetFile>, BridgeError> {
    let index = ObjectIndex::build(result);
    search_objects(result)?
        .iter()
        .filter_map(|value| index.resolve(value))
        .map(|value| -> Result<DatasetFile, BridgeError> {
            Ok(DatasetFile {
                dataset_perm_id: nested_str(&index, value, "dataSetPermId", "permId")?,
                path: value
                    .get("path")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                is_directory: value
                    .get("directory")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                file_length: value
                    .get("fileLength")
                    .and_then(Value::as_i64)
                    .map(|length| length.max(0) as u64)
                    .unwrap_or(0),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn experiment_result() -> Value {
        json!({
            "/SPACE/PROJECT/EXP1": {
                "@id": 1,
                "code": "EXP1",
                "permId": { "@id": 2, "permId": "P1" },
                "identifier": { "@id": 3, "identifier": "/SPACE/PROJECT/EXP1" },
                "type": { "@id": 4, "code": "MS" },
                "samples": [
                    {
                        "@id": 5,
                        "code": "S1",
                        "permId": { "@id": 6, "permId": "SP1" },
                        "identifier": { "@id": 7, "identifier": "/SPACE/S1" },
                        "registrationDate": 1719913117000_i64,
                        "properties": { "COLOR": "red" },
                        "type": {
                            "@id": 8,
                            "code": "TYPE_A",
                            "propertyAssignments": [{
                                "@id": 9,
                                "propertyType": {
                                    "@id": 10,
                                    "code": "COLOR",
                                    "label": "color",
                                    "dataType": "VARCHAR"
                                }
                            }]
                        }
                    },
                    {
                        "@id": 11,
                        "code": "S2",
                        "permId": { "@id": 12, "permId": "SP2" },
                        "identifier": { "@id": 13, "identifier": "/SPACE/S2" },
                        "registrationDate": 1719913117000_i64,
                        "properties": {},
                        "type": 8
                    }
                ],
                "dataSets": [{
                    "@id": 14,
                    "permId": { "@id": 15, "permId": "D1" },
                    "type": { "@id": 16, "code": "RAW" }
                }]
            }
        })
    }

    #[test]
    fn parses_graph_with_back_references() {
        let (experiment, samples, datasets) =
            parse_experiment_graph(&experiment_result()).unwrap().unwrap();
        assert_eq!(experiment.perm_id, "P1");
        assert_eq!(experiment.type_code, "MS");
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].sample_type.code, "TYPE_A");
        assert_eq!(
            samples[1].sample_type.property_assignments[0].data_kind,
            DataKind::Varchar
        );
        assert_eq!(
            samples[0].registration_date.date_naive().to_string(),
            "2024-07-02"
        );
        assert_eq!(datasets, vec![("D1".to_string(), "RAW".to_string())]);
    }

    #[test]
    fn empty_get_result_is_not_found() {
        assert!(parse_experiment_graph(&json!({})).unwrap().is_none());
    }

    #[test]
    fn parses_dataset_files() {
        let result = json!({
            "objects": [
                { "@id": 1, "path": "original", "directory": true, "fileLength": -1,
                  "dataSetPermId": { "@id": 2, "permId": "D1" } },
                { "@id": 3, "path": "original/data.csv", "directory": false, "fileLength": 12,
                  "dataSetPermId": 2 }
            ]
        });
        let files = parse_dataset_files(&result).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].file_length, 0);
        assert_eq!(files[1].dataset_perm_id, "D1");
        assert!(!files[1].is_directory);
    }

    #[test]
    fn rpc_errors_are_surfaced() {
        let err = rpc_result(
            "getExperiments",
            json!({ "error": { "message": "Session no longer available" } }),
        )
        .unwrap_err();
        assert_matches!(err, BridgeError::OpenbisRpc { method, .. } if method == "getExperiments");
        assert_eq!(
            rpc_result("login", json!({ "result": "token-1" })).unwrap(),
            json!("token-1")
        );
    }

    #[test]
    fn download_url_escapes_path_segments() {
        let url = file_download_url(
            "https://openbis.test/",
            "20240702093837370-684137",
            "original/my run/data.csv",
            "token",
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://openbis.test/datastore_server/20240702093837370-684137/original/my%20run/data.csv?sessionID=token"
        );
    }
}
