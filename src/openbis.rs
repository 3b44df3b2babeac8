use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use chrono::DateTime;
use reqwest::blocking::{Body, Client};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::credentials::Credentials;
use crate::domain::{CollectionPath, DatasetCode, RelationKind, RelationshipRecord};
use crate::error::ObisError;
use crate::fs_util::{enclosed_path, write_bytes_atomic};
use crate::reconcile::RemoteFileDescriptor;

const AS_ENDPOINT: &str = "openbis/openbis/rmi-application-server-v3.json";
const DSS_ENDPOINT: &str = "datastore_server/rmi-data-store-server-v3.json";
const DSS_V1_ENDPOINT: &str = "datastore_server/rmi-dss-api-v1.json";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpaceSummary {
    pub code: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntitySummary {
    pub code: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub identifier: Option<String>,
    pub registration_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetInfo {
    pub code: String,
    #[serde(rename = "type")]
    pub dataset_type: String,
    pub registration_date: Option<String>,
    pub experiment: Option<String>,
    pub sample: Option<String>,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleInfo {
    pub code: String,
    pub identifier: Option<String>,
    #[serde(rename = "type")]
    pub sample_type: String,
    pub experiment: Option<String>,
    pub registration_date: Option<String>,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewDataset {
    pub dataset_type: String,
    pub collection: CollectionPath,
    pub files: Vec<PathBuf>,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferScope<'a> {
    Full,
    Files(&'a [String]),
}

/// Everything the toolkit needs from an OpenBIS server. Implementations
/// return records already normalized into the structs above.
pub trait OpenbisClient: Send + Sync {
    fn list_spaces(&self) -> Result<Vec<SpaceSummary>, ObisError>;
    fn count_projects(&self, space: &str) -> Result<usize, ObisError>;
    fn search_experiments(&self, pattern: &str) -> Result<Vec<EntitySummary>, ObisError>;
    fn search_samples(&self, pattern: &str) -> Result<Vec<EntitySummary>, ObisError>;
    fn search_datasets(&self, pattern: &str) -> Result<Vec<EntitySummary>, ObisError>;
    fn get_dataset(&self, code: &DatasetCode) -> Result<Option<DatasetInfo>, ObisError>;
    fn get_sample(&self, code: &str) -> Result<Option<SampleInfo>, ObisError>;
    fn collection_exists(&self, collection: &CollectionPath) -> Result<bool, ObisError>;
    fn collection_datasets(
        &self,
        collection: &CollectionPath,
    ) -> Result<Vec<EntitySummary>, ObisError>;
    fn sample_datasets(&self, sample: &str) -> Result<Vec<EntitySummary>, ObisError>;
    fn list_files(&self, code: &DatasetCode) -> Result<Vec<RemoteFileDescriptor>, ObisError>;
    /// Server-side filtered search returning only relationship fields.
    fn query_related(
        &self,
        code: &DatasetCode,
        kind: RelationKind,
    ) -> Result<Vec<RelationshipRecord>, ObisError>;
    /// Loads the dataset itself and walks its own parent/child links.
    fn traverse_related(
        &self,
        code: &DatasetCode,
        kind: RelationKind,
    ) -> Result<Vec<RelationshipRecord>, ObisError>;
    fn download(
        &self,
        code: &DatasetCode,
        scope: TransferScope<'_>,
        destination: &Path,
    ) -> Result<(), ObisError>;
    fn create_dataset(&self, request: &NewDataset) -> Result<String, ObisError>;
}

pub struct OpenbisHttpClient {
    client: Client,
    base_url: String,
    credentials: Credentials,
    token_path: Option<PathBuf>,
    session: OnceLock<String>,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    message: Option<String>,
}

impl OpenbisHttpClient {
    pub fn new(
        credentials: Credentials,
        verify_certificates: bool,
        token_path: Option<PathBuf>,
    ) -> Result<Self, ObisError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("openbis-toolkit/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| ObisError::OpenbisHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .danger_accept_invalid_certs(!verify_certificates)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|err| ObisError::OpenbisHttp(err.to_string()))?;

        Ok(Self {
            client,
            base_url: credentials.url.trim_end_matches('/').to_string(),
            credentials,
            token_path,
            session: OnceLock::new(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn session_token(&self) -> Result<&str, ObisError> {
        if let Some(token) = self.session.get() {
            return Ok(token.as_str());
        }

        let cached = self
            .token_path
            .as_ref()
            .and_then(|path| fs::read_to_string(path).ok())
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty());

        let token = match cached {
            Some(token) if self.is_session_active(&token) => token,
            _ => {
                let token = self.login()?;
                self.save_token(&token);
                token
            }
        };
        Ok(self.session.get_or_init(|| token).as_str())
    }

    fn is_session_active(&self, token: &str) -> bool {
        self.rpc(AS_ENDPOINT, "isSessionActive", json!([token]))
            .ok()
            .and_then(|value| value.as_bool())
            .unwrap_or(false)
    }

    fn login(&self) -> Result<String, ObisError> {
        tracing::debug!(user = %self.credentials.username, "logging in to OpenBIS");
        let result = self.rpc(
            AS_ENDPOINT,
            "login",
            json!([self.credentials.username, self.credentials.password]),
        )?;
        result
            .as_str()
            .map(|token| token.to_string())
            .ok_or_else(|| ObisError::Authentication("server returned no session token".into()))
    }

    fn save_token(&self, token: &str) {
        let Some(path) = &self.token_path else {
            return;
        };
        if let Err(err) = write_bytes_atomic(path, token.as_bytes()) {
            tracing::warn!(path = %path.display(), %err, "could not cache session token");
        }
    }

    fn rpc(&self, endpoint: &str, method: &str, params: Value) -> Result<Value, ObisError> {
        let url = self.endpoint(endpoint);
        let body = json!({
            "jsonrpc": "2.0",
            "id": "1",
            "method": method,
            "params": params,
        });
        let response = self.send_with_retries(|| self.client.post(&url).json(&body))?;
        let response = Self::handle_status(response)?;
        let envelope: RpcEnvelope = response
            .json()
            .map_err(|err| ObisError::OpenbisHttp(err.to_string()))?;
        if let Some(error) = envelope.error {
            return Err(ObisError::OpenbisRpc {
                method: method.to_string(),
                message: error.message.unwrap_or_else(|| "unknown error".to_string()),
            });
        }
        Ok(envelope.result.unwrap_or(Value::Null))
    }

    fn call_as(&self, method: &str, mut params: Vec<Value>) -> Result<Value, ObisError> {
        let token = self.session_token()?.to_string();
        params.insert(0, Value::String(token));
        self.rpc(AS_ENDPOINT, method, Value::Array(params))
    }

    fn call_dss(&self, method: &str, mut params: Vec<Value>) -> Result<Value, ObisError> {
        let token = self.session_token()?.to_string();
        params.insert(0, Value::String(token));
        self.rpc(DSS_ENDPOINT, method, Value::Array(params))
    }

    /// Recursive listing through the v1 DSS API, used when the v3 file
    /// search is unavailable.
    fn legacy_file_paths(&self, code: &DatasetCode) -> Result<Vec<String>, ObisError> {
        let token = self.session_token()?.to_string();
        let result = self.rpc(
            DSS_V1_ENDPOINT,
            "listFilesForDataSet",
            json!([token, code.as_str(), "/", true]),
        )?;
        Ok(result
            .as_array()
            .map(Vec::as_slice)
            .unwrap_or(&[])
            .iter()
            .filter(|file| !file.get("isDirectory").and_then(Value::as_bool).unwrap_or(false))
            .filter_map(|file| string_field(file, "pathInDataSet"))
            .collect())
    }

    fn search_entities(
        &self,
        method: &str,
        criteria: Value,
        fetch_options: Value,
    ) -> Result<Vec<Value>, ObisError> {
        let result = self.call_as(method, vec![criteria, fetch_options])?;
        Ok(search_objects(&result).to_vec())
    }

    fn download_file(
        &self,
        code: &DatasetCode,
        path: &str,
        destination: &Path,
    ) -> Result<(), ObisError> {
        let target = enclosed_path(destination, path)?;
        let token = self.session_token()?.to_string();
        let url = format!(
            "{}/datastore_server/{}/{}",
            self.base_url,
            code.as_str(),
            path.trim_start_matches('/')
        );
        let response =
            self.send_with_retries(|| self.client.get(&url).query(&[("sessionID", &token)]))?;
        let mut response = Self::handle_status(response)?;

        let parent = target
            .parent()
            .ok_or_else(|| ObisError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent).map_err(|err| ObisError::Filesystem(err.to_string()))?;
        let mut temp = tempfile::Builder::new()
            .prefix(".openbis-part")
            .tempfile_in(parent)
            .map_err(|err| ObisError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, temp.as_file_mut())
            .map_err(|err| ObisError::OpenbisHttp(err.to_string()))?;
        temp.persist(&target)
            .map_err(|err| ObisError::Filesystem(err.to_string()))?;
        Ok(())
    }

    fn upload_to_workspace(&self, upload_id: &str, file: &Path) -> Result<(), ObisError> {
        let token = self.session_token()?.to_string();
        let name = file
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| ObisError::Filesystem(format!("invalid file name {}", file.display())))?;
        let size = fs::metadata(file)
            .map_err(|err| ObisError::Filesystem(format!("stat {}: {err}", file.display())))?
            .len();
        let size_text = size.to_string();
        let filename = format!("{upload_id}/{name}");
        let url = self.endpoint("datastore_server/session_workspace_file_upload");
        // reopened per attempt so a retry starts from the first byte
        let response = self.try_send_with_retries(|| {
            let body = file_body(file, size)?;
            Ok(self
                .client
                .post(&url)
                .query(&[
                    ("sessionID", token.as_str()),
                    ("filename", filename.as_str()),
                    ("id", "1"),
                    ("startByte", "0"),
                    ("endByte", size_text.as_str()),
                    ("size", size_text.as_str()),
                    ("emptyFolder", "false"),
                ])
                .body(body))
        })?;
        Self::handle_status(response)?;
        Ok(())
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, ObisError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "OpenBIS request failed".to_string());
        Err(ObisError::OpenbisStatus { status, message })
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, ObisError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        self.try_send_with_retries(|| Ok(make_req()))
    }

    fn try_send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, ObisError>
    where
        F: FnMut() -> Result<reqwest::blocking::RequestBuilder, ObisError>,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = make_req()?.send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(ObisError::OpenbisHttp(err.to_string()));
                }
            }
        }
    }
}

impl OpenbisClient for OpenbisHttpClient {
    fn list_spaces(&self) -> Result<Vec<SpaceSummary>, ObisError> {
        let objects = self.search_entities(
            "searchSpaces",
            json!({"@type": "as.dto.space.search.SpaceSearchCriteria"}),
            json!({"@type": "as.dto.space.fetchoptions.SpaceFetchOptions"}),
        )?;
        Ok(objects
            .iter()
            .map(|space| SpaceSummary {
                code: string_field(space, "code").unwrap_or_default(),
                description: string_field(space, "description").filter(|d| !d.is_empty()),
            })
            .collect())
    }

    fn count_projects(&self, space: &str) -> Result<usize, ObisError> {
        let result = self.call_as(
            "searchProjects",
            vec![
                json!({
                    "@type": "as.dto.project.search.ProjectSearchCriteria",
                    "operator": "AND",
                    "criteria": [{
                        "@type": "as.dto.space.search.SpaceSearchCriteria",
                        "operator": "AND",
                        "criteria": [code_equals(space)],
                    }],
                }),
                json!({"@type": "as.dto.project.fetchoptions.ProjectFetchOptions"}),
            ],
        )?;
        Ok(result
            .get("totalCount")
            .and_then(Value::as_u64)
            .map(|count| count as usize)
            .unwrap_or_else(|| search_objects(&result).len()))
    }

    fn search_experiments(&self, pattern: &str) -> Result<Vec<EntitySummary>, ObisError> {
        let objects = self.search_entities(
            "searchExperiments",
            json!({
                "@type": "as.dto.experiment.search.ExperimentSearchCriteria",
                "operator": "AND",
                "criteria": [code_contains(pattern)],
            }),
            json!({
                "@type": "as.dto.experiment.fetchoptions.ExperimentFetchOptions",
                "type": {"@type": "as.dto.experiment.fetchoptions.ExperimentTypeFetchOptions"},
            }),
        )?;
        Ok(normalize_summaries(&objects))
    }

    fn search_samples(&self, pattern: &str) -> Result<Vec<EntitySummary>, ObisError> {
        let objects = self.search_entities(
            "searchSamples",
            json!({
                "@type": "as.dto.sample.search.SampleSearchCriteria",
                "operator": "AND",
                "criteria": [code_contains(pattern)],
            }),
            json!({
                "@type": "as.dto.sample.fetchoptions.SampleFetchOptions",
                "type": {"@type": "as.dto.sample.fetchoptions.SampleTypeFetchOptions"},
            }),
        )?;
        Ok(normalize_summaries(&objects))
    }

    fn search_datasets(&self, pattern: &str) -> Result<Vec<EntitySummary>, ObisError> {
        let objects = self.search_entities(
            "searchDataSets",
            json!({
                "@type": "as.dto.dataset.search.DataSetSearchCriteria",
                "operator": "AND",
                "criteria": [code_contains(pattern)],
            }),
            dataset_type_fetch_options(),
        )?;
        Ok(normalize_summaries(&objects))
    }

    fn get_dataset(&self, code: &DatasetCode) -> Result<Option<DatasetInfo>, ObisError> {
        let result = self.call_as(
            "getDataSets",
            vec![
                json!([dataset_perm_id(code)]),
                json!({
                    "@type": "as.dto.dataset.fetchoptions.DataSetFetchOptions",
                    "type": {"@type": "as.dto.dataset.fetchoptions.DataSetTypeFetchOptions"},
                    "properties": {"@type": "as.dto.property.fetchoptions.PropertyFetchOptions"},
                    "experiment": {"@type": "as.dto.experiment.fetchoptions.ExperimentFetchOptions"},
                    "sample": {"@type": "as.dto.sample.fetchoptions.SampleFetchOptions"},
                }),
            ],
        )?;
        let ids = IdTable::build(&result);
        let Some(dataset) = map_values(&result).into_iter().next() else {
            return Ok(None);
        };
        Ok(Some(DatasetInfo {
            code: string_field(dataset, "code").unwrap_or_else(|| code.to_string()),
            dataset_type: type_code(dataset, &ids),
            registration_date: registration_date(dataset),
            experiment: ids
                .deref(dataset.get("experiment"))
                .and_then(identifier_of),
            sample: ids.deref(dataset.get("sample")).and_then(identifier_of),
            properties: properties_of(dataset),
        }))
    }

    fn get_sample(&self, code: &str) -> Result<Option<SampleInfo>, ObisError> {
        let result = self.call_as(
            "searchSamples",
            vec![
                json!({
                    "@type": "as.dto.sample.search.SampleSearchCriteria",
                    "operator": "AND",
                    "criteria": [code_equals(code)],
                }),
                json!({
                    "@type": "as.dto.sample.fetchoptions.SampleFetchOptions",
                    "type": {"@type": "as.dto.sample.fetchoptions.SampleTypeFetchOptions"},
                    "properties": {"@type": "as.dto.property.fetchoptions.PropertyFetchOptions"},
                    "experiment": {"@type": "as.dto.experiment.fetchoptions.ExperimentFetchOptions"},
                }),
            ],
        )?;
        let ids = IdTable::build(&result);
        let objects = search_objects(&result);
        let Some(sample) = objects.first() else {
            return Ok(None);
        };
        Ok(Some(SampleInfo {
            code: string_field(sample, "code").unwrap_or_else(|| code.to_string()),
            identifier: identifier_of(sample),
            sample_type: type_code(sample, &ids),
            experiment: ids.deref(sample.get("experiment")).and_then(identifier_of),
            registration_date: registration_date(sample),
            properties: properties_of(sample),
        }))
    }

    fn collection_exists(&self, collection: &CollectionPath) -> Result<bool, ObisError> {
        let result = self.call_as(
            "getExperiments",
            vec![
                json!([{
                    "@type": "as.dto.experiment.id.ExperimentIdentifier",
                    "identifier": collection.as_str(),
                }]),
                json!({"@type": "as.dto.experiment.fetchoptions.ExperimentFetchOptions"}),
            ],
        )?;
        Ok(!map_values(&result).is_empty())
    }

    fn collection_datasets(
        &self,
        collection: &CollectionPath,
    ) -> Result<Vec<EntitySummary>, ObisError> {
        let objects = self.search_entities(
            "searchDataSets",
            json!({
                "@type": "as.dto.dataset.search.DataSetSearchCriteria",
                "operator": "AND",
                "criteria": [{
                    "@type": "as.dto.experiment.search.ExperimentSearchCriteria",
                    "operator": "AND",
                    "criteria": [{
                        "@type": "as.dto.common.search.IdentifierSearchCriteria",
                        "fieldValue": {
                            "@type": "as.dto.common.search.StringEqualToValue",
                            "value": collection.as_str(),
                        },
                    }],
                }],
            }),
            dataset_type_fetch_options(),
        )?;
        Ok(normalize_summaries(&objects))
    }

    fn sample_datasets(&self, sample: &str) -> Result<Vec<EntitySummary>, ObisError> {
        let objects = self.search_entities(
            "searchDataSets",
            json!({
                "@type": "as.dto.dataset.search.DataSetSearchCriteria",
                "operator": "AND",
                "criteria": [{
                    "@type": "as.dto.sample.search.SampleSearchCriteria",
                    "operator": "AND",
                    "criteria": [code_equals(sample)],
                }],
            }),
            dataset_type_fetch_options(),
        )?;
        Ok(normalize_summaries(&objects))
    }

    fn list_files(&self, code: &DatasetCode) -> Result<Vec<RemoteFileDescriptor>, ObisError> {
        let result = self.call_dss(
            "searchFiles",
            vec![
                json!({
                    "@type": "dss.dto.datasetfile.search.DataSetFileSearchCriteria",
                    "operator": "AND",
                    "criteria": [{
                        "@type": "as.dto.dataset.search.DataSetSearchCriteria",
                        "relation": "DATASET",
                        "operator": "AND",
                        "criteria": [{
                            "@type": "as.dto.common.search.PermIdSearchCriteria",
                            "fieldValue": {
                                "@type": "as.dto.common.search.StringEqualToValue",
                                "value": code.as_str(),
                            },
                        }],
                    }],
                }),
                json!({"@type": "dss.dto.datasetfile.fetchoptions.DataSetFileFetchOptions"}),
            ],
        )?;
        Ok(search_objects(&result)
            .iter()
            .filter_map(normalize_file)
            .collect())
    }

    fn query_related(
        &self,
        code: &DatasetCode,
        kind: RelationKind,
    ) -> Result<Vec<RelationshipRecord>, ObisError> {
        // children of X are the datasets whose parents include X, and vice versa
        let filter_type = match kind {
            RelationKind::Children => "as.dto.dataset.search.DataSetParentsSearchCriteria",
            RelationKind::Parents => "as.dto.dataset.search.DataSetChildrenSearchCriteria",
        };
        let result = self.call_as(
            "searchDataSets",
            vec![
                json!({
                    "@type": "as.dto.dataset.search.DataSetSearchCriteria",
                    "operator": "AND",
                    "criteria": [{
                        "@type": filter_type,
                        "operator": "AND",
                        "criteria": [code_equals(code.as_str())],
                    }],
                }),
                dataset_type_fetch_options(),
            ],
        )?;
        let ids = IdTable::build(&result);
        Ok(search_objects(&result)
            .iter()
            .map(|dataset| normalize_relationship(dataset, &ids))
            .collect())
    }

    fn traverse_related(
        &self,
        code: &DatasetCode,
        kind: RelationKind,
    ) -> Result<Vec<RelationshipRecord>, ObisError> {
        let related_options = json!({
            "@type": "as.dto.dataset.fetchoptions.DataSetFetchOptions",
            "type": {"@type": "as.dto.dataset.fetchoptions.DataSetTypeFetchOptions"},
            "properties": {"@type": "as.dto.property.fetchoptions.PropertyFetchOptions"},
        });
        let mut fetch_options = json!({
            "@type": "as.dto.dataset.fetchoptions.DataSetFetchOptions",
        });
        fetch_options[kind.as_str()] = related_options;

        let result = self.call_as(
            "getDataSets",
            vec![json!([dataset_perm_id(code)]), fetch_options],
        )?;
        let ids = IdTable::build(&result);
        let dataset = map_values(&result)
            .into_iter()
            .next()
            .ok_or_else(|| ObisError::DatasetNotFound(code.to_string()))?;
        let related = dataset
            .get(kind.as_str())
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        Ok(related
            .iter()
            .filter_map(|item| ids.deref(Some(item)))
            .map(|item| normalize_relationship(item, &ids))
            .collect())
    }

    fn download(
        &self,
        code: &DatasetCode,
        scope: TransferScope<'_>,
        destination: &Path,
    ) -> Result<(), ObisError> {
        fs::create_dir_all(destination).map_err(|err| ObisError::Filesystem(err.to_string()))?;
        let paths = match scope {
            TransferScope::Files(paths) => paths.to_vec(),
            TransferScope::Full => self.legacy_file_paths(code)?,
        };
        for path in &paths {
            tracing::debug!(dataset = %code, %path, "downloading file");
            self.download_file(code, path, destination)?;
        }
        Ok(())
    }

    fn create_dataset(&self, request: &NewDataset) -> Result<String, ObisError> {
        let upload_id = format!(
            "openbis-toolkit-{}-{}",
            chrono::Utc::now().timestamp_millis(),
            std::process::id()
        );
        for file in &request.files {
            self.upload_to_workspace(&upload_id, file)?;
        }
        let result = self.call_dss(
            "createUploadedDataSet",
            vec![json!({
                "@type": "dss.dto.dataset.create.UploadedDataSetCreation",
                "typeId": {
                    "@type": "as.dto.entitytype.id.EntityTypePermId",
                    "permId": request.dataset_type,
                    "entityKind": "DATA_SET",
                },
                "experimentId": {
                    "@type": "as.dto.experiment.id.ExperimentIdentifier",
                    "identifier": request.collection.as_str(),
                },
                "properties": request.properties,
                "parentIds": [],
                "uploadId": upload_id,
            })],
        )?;
        result
            .get("permId")
            .and_then(Value::as_str)
            .or_else(|| result.as_str())
            .map(|perm_id| perm_id.to_string())
            .ok_or_else(|| ObisError::OpenbisRpc {
                method: "createUploadedDataSet".to_string(),
                message: "no perm id in response".to_string(),
            })
    }
}

/// Objects serialized once by the server and referenced later by `@id`.
struct IdTable<'a> {
    objects: HashMap<u64, &'a Value>,
}

impl<'a> IdTable<'a> {
    fn build(root: &'a Value) -> Self {
        let mut objects = HashMap::new();
        let mut stack = vec![root];
        while let Some(value) = stack.pop() {
            match value {
                Value::Object(map) => {
                    if let Some(id) = map.get("@id").and_then(Value::as_u64) {
                        objects.insert(id, value);
                    }
                    stack.extend(map.values());
                }
                Value::Array(items) => stack.extend(items.iter()),
                _ => {}
            }
        }
        Self { objects }
    }

    fn deref<'b>(&self, value: Option<&'b Value>) -> Option<&'b Value>
    where
        'a: 'b,
    {
        match value? {
            Value::Number(id) => id.as_u64().and_then(|id| self.objects.get(&id).copied()),
            Value::Null => None,
            other => Some(other),
        }
    }
}

fn search_objects(result: &Value) -> &[Value] {
    result
        .get("objects")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn map_values(result: &Value) -> Vec<&Value> {
    result
        .as_object()
        .map(|map| map.values().filter(|value| value.is_object()).collect())
        .unwrap_or_default()
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(|value| value.to_string())
}

fn identifier_of(value: &Value) -> Option<String> {
    value
        .get("identifier")
        .and_then(|id| id.get("identifier").or(Some(id)))
        .and_then(Value::as_str)
        .map(|value| value.to_string())
}

fn type_code(value: &Value, ids: &IdTable<'_>) -> String {
    ids.deref(value.get("type"))
        .and_then(|entity_type| string_field(entity_type, "code"))
        .unwrap_or_else(|| "UNKNOWN".to_string())
}

fn registration_date(value: &Value) -> Option<String> {
    match value.get("registrationDate")? {
        Value::Number(millis) => millis
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .map(|date| date.to_rfc3339()),
        Value::String(text) => Some(text.clone()),
        _ => None,
    }
}

fn properties_of(value: &Value) -> BTreeMap<String, String> {
    value
        .get("properties")
        .and_then(Value::as_object)
        .map(|props| {
            props
                .iter()
                .map(|(key, value)| {
                    let rendered = match value {
                        Value::String(text) => text.clone(),
                        other => other.to_string(),
                    };
                    (key.to_lowercase(), rendered)
                })
                .collect()
        })
        .unwrap_or_default()
}

fn normalize_summaries(objects: &[Value]) -> Vec<EntitySummary> {
    let root = Value::Array(objects.to_vec());
    let ids = IdTable::build(&root);
    objects
        .iter()
        .map(|object| EntitySummary {
            code: string_field(object, "code").unwrap_or_default(),
            entity_type: type_code(object, &ids),
            identifier: identifier_of(object),
            registration_date: registration_date(object),
        })
        .collect()
}

fn normalize_relationship(value: &Value, ids: &IdTable<'_>) -> RelationshipRecord {
    let properties = properties_of(value);
    RelationshipRecord {
        code: string_field(value, "code").unwrap_or_default(),
        dataset_type: type_code(value, ids),
        name: properties
            .get("$name")
            .or_else(|| properties.get("name"))
            .cloned(),
        registration_date: registration_date(value),
    }
}

fn normalize_file(value: &Value) -> Option<RemoteFileDescriptor> {
    if value.get("directory").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }
    let path = string_field(value, "path").filter(|path| !path.is_empty())?;
    let mut file = RemoteFileDescriptor::new(path);
    file.size = value.get("fileLength").and_then(Value::as_u64);
    let checksum_type = string_field(value, "checksumType")
        .map(|kind| kind.to_uppercase().replace('-', ""))
        .unwrap_or_default();
    if checksum_type == "SHA1" {
        file.checksum = string_field(value, "checksum").filter(|sum| !sum.is_empty());
    }
    Some(file)
}

fn code_equals(code: &str) -> Value {
    json!({
        "@type": "as.dto.common.search.CodeSearchCriteria",
        "fieldValue": {
            "@type": "as.dto.common.search.StringEqualToValue",
            "value": code,
        },
    })
}

fn code_contains(pattern: &str) -> Value {
    json!({
        "@type": "as.dto.common.search.CodeSearchCriteria",
        "fieldValue": {
            "@type": "as.dto.common.search.StringContainsValue",
            "value": pattern.trim_matches('*'),
        },
    })
}

fn dataset_perm_id(code: &DatasetCode) -> Value {
    json!({
        "@type": "as.dto.dataset.id.DataSetPermId",
        "permId": code.as_str(),
    })
}

fn dataset_type_fetch_options() -> Value {
    json!({
        "@type": "as.dto.dataset.fetchoptions.DataSetFetchOptions",
        "type": {"@type": "as.dto.dataset.fetchoptions.DataSetTypeFetchOptions"},
    })
}

/// Streams `file` from disk instead of buffering it.
fn file_body(file: &Path, size: u64) -> Result<Body, ObisError> {
    let handle = File::open(file)
        .map_err(|err| ObisError::Filesystem(format!("open {}: {err}", file.display())))?;
    Ok(Body::sized(handle, size))
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_referenced_types() {
        let result = json!({
            "objects": [
                {"code": "DS1", "type": {"@id": 7, "code": "RAW_DATA"}, "registrationDate": 0},
                {"code": "DS2", "type": 7, "properties": {"$NAME": "second"}},
            ]
        });
        let ids = IdTable::build(&result);
        let records = search_objects(&result)
            .iter()
            .map(|dataset| normalize_relationship(dataset, &ids))
            .collect::<Vec<_>>();
        assert_eq!(records[1].dataset_type, "RAW_DATA");
        assert_eq!(records[1].name.as_deref(), Some("second"));
        assert_eq!(
            records[0].registration_date.as_deref(),
            Some("1970-01-01T00:00:00+00:00")
        );
    }

    #[test]
    fn upload_body_is_streamed_and_reopenable() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("library.tsv");
        fs::write(&file, b"a\tb\n").unwrap();

        let first = file_body(&file, 4).unwrap();
        let second = file_body(&file, 4).unwrap();

        assert!(first.as_bytes().is_none());
        assert!(second.as_bytes().is_none());
        let missing = file_body(&temp.path().join("gone.tsv"), 0).unwrap_err();
        assert_matches::assert_matches!(missing, ObisError::Filesystem(message) if message.contains("gone.tsv"));
    }

    #[test]
    fn file_normalization_skips_directories() {
        let dir = json!({"path": "original", "directory": true});
        assert!(normalize_file(&dir).is_none());

        let file = json!({
            "path": "original/a.txt",
            "directory": false,
            "fileLength": 100,
            "checksumType": "SHA-1",
            "checksum": "ABC",
        });
        let file = normalize_file(&file).unwrap();
        assert_eq!(file.size, Some(100));
        assert_eq!(file.checksum.as_deref(), Some("ABC"));
    }

    #[test]
    fn crc_only_files_carry_no_checksum() {
        let file = json!({"path": "a.raw", "fileLength": 5, "checksumCRC32": 1234});
        assert!(normalize_file(&file).unwrap().checksum.is_none());
    }
}
