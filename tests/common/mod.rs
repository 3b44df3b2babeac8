#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use openbis_toolkit::app::{ProgressEvent, ProgressSink};
use openbis_toolkit::domain::{CollectionPath, DatasetCode, RelationKind, RelationshipRecord};
use openbis_toolkit::error::ObisError;
use openbis_toolkit::fs_util::enclosed_path;
use openbis_toolkit::openbis::{
    DatasetInfo, EntitySummary, NewDataset, OpenbisClient, SampleInfo, SpaceSummary,
    TransferScope,
};
use openbis_toolkit::reconcile::RemoteFileDescriptor;

#[derive(Debug, Clone, PartialEq)]
pub enum Transfer {
    Full(String),
    Files(String, Vec<String>),
}

#[derive(Default)]
pub struct Calls {
    pub query_related: usize,
    pub traverse_related: usize,
    pub list_files: usize,
    pub transfers: Vec<Transfer>,
    pub created: Vec<NewDataset>,
}

/// In-memory OpenBIS. Downloads write `size` bytes of `x` per manifest entry.
#[derive(Default)]
pub struct MockOpenbis {
    pub spaces: Vec<SpaceSummary>,
    pub datasets: HashMap<String, DatasetInfo>,
    pub samples: HashMap<String, SampleInfo>,
    pub manifests: HashMap<String, Vec<RemoteFileDescriptor>>,
    pub manifest_fails: bool,
    /// Files materialized by a full download when the manifest is unavailable.
    pub full_files: Vec<String>,
    pub failing_downloads: Vec<String>,
    pub collections: HashMap<String, Vec<EntitySummary>>,
    pub related: HashMap<(RelationKind, String), Vec<RelationshipRecord>>,
    pub traversal: HashMap<(RelationKind, String), Vec<RelationshipRecord>>,
    pub query_fails: bool,
    pub traverse_fails: bool,
    pub calls: Mutex<Calls>,
}

impl MockOpenbis {
    pub fn with_dataset(mut self, code: &str, files: Vec<RemoteFileDescriptor>) -> Self {
        self.datasets.insert(code.to_string(), dataset_info(code));
        self.manifests.insert(code.to_string(), files);
        self
    }

    pub fn with_related(mut self, kind: RelationKind, code: &str, records: Vec<RelationshipRecord>) -> Self {
        self.related.insert((kind, code.to_string()), records);
        self
    }

    pub fn with_traversal(
        mut self,
        kind: RelationKind,
        code: &str,
        records: Vec<RelationshipRecord>,
    ) -> Self {
        self.traversal.insert((kind, code.to_string()), records);
        self
    }

    pub fn query_calls(&self) -> usize {
        self.calls.lock().unwrap().query_related
    }

    pub fn traverse_calls(&self) -> usize {
        self.calls.lock().unwrap().traverse_related
    }

    pub fn transfers(&self) -> Vec<Transfer> {
        self.calls.lock().unwrap().transfers.clone()
    }

    fn write_file(destination: &Path, path: &str, size: u64) -> Result<(), ObisError> {
        let target = enclosed_path(destination, path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| ObisError::Filesystem(err.to_string()))?;
        }
        fs::write(&target, vec![b'x'; size as usize])
            .map_err(|err| ObisError::Filesystem(err.to_string()))
    }
}

pub fn dataset_info(code: &str) -> DatasetInfo {
    DatasetInfo {
        code: code.to_string(),
        dataset_type: "RAW_DATA".to_string(),
        registration_date: None,
        experiment: Some("/DDB/CK/RAW".to_string()),
        sample: None,
        properties: Default::default(),
    }
}

pub fn summary(code: &str) -> EntitySummary {
    EntitySummary {
        code: code.to_string(),
        entity_type: "RAW_DATA".to_string(),
        identifier: None,
        registration_date: None,
    }
}

pub fn record(code: &str) -> RelationshipRecord {
    RelationshipRecord {
        code: code.to_string(),
        dataset_type: "RAW_DATA".to_string(),
        name: None,
        registration_date: None,
    }
}

pub fn code(value: &str) -> DatasetCode {
    value.parse().unwrap()
}

impl OpenbisClient for MockOpenbis {
    fn list_spaces(&self) -> Result<Vec<SpaceSummary>, ObisError> {
        Ok(self.spaces.clone())
    }

    fn count_projects(&self, _space: &str) -> Result<usize, ObisError> {
        Ok(2)
    }

    fn search_experiments(&self, _pattern: &str) -> Result<Vec<EntitySummary>, ObisError> {
        Err(ObisError::OpenbisHttp("experiments unavailable".to_string()))
    }

    fn search_samples(&self, pattern: &str) -> Result<Vec<EntitySummary>, ObisError> {
        Ok(self
            .samples
            .keys()
            .filter(|code| code.contains(pattern))
            .map(|code| summary(code))
            .collect())
    }

    fn search_datasets(&self, pattern: &str) -> Result<Vec<EntitySummary>, ObisError> {
        let mut codes = self
            .datasets
            .keys()
            .filter(|code| code.contains(pattern))
            .cloned()
            .collect::<Vec<_>>();
        codes.sort();
        Ok(codes.iter().map(|code| summary(code)).collect())
    }

    fn get_dataset(&self, code: &DatasetCode) -> Result<Option<DatasetInfo>, ObisError> {
        Ok(self.datasets.get(code.as_str()).cloned())
    }

    fn get_sample(&self, code: &str) -> Result<Option<SampleInfo>, ObisError> {
        Ok(self.samples.get(code).cloned())
    }

    fn collection_exists(&self, collection: &CollectionPath) -> Result<bool, ObisError> {
        Ok(self.collections.contains_key(collection.as_str()))
    }

    fn collection_datasets(
        &self,
        collection: &CollectionPath,
    ) -> Result<Vec<EntitySummary>, ObisError> {
        Ok(self
            .collections
            .get(collection.as_str())
            .cloned()
            .unwrap_or_default())
    }

    fn sample_datasets(&self, _sample: &str) -> Result<Vec<EntitySummary>, ObisError> {
        Err(ObisError::OpenbisHttp("not supported".to_string()))
    }

    fn list_files(&self, code: &DatasetCode) -> Result<Vec<RemoteFileDescriptor>, ObisError> {
        self.calls.lock().unwrap().list_files += 1;
        if self.manifest_fails {
            return Err(ObisError::OpenbisHttp("manifest unavailable".to_string()));
        }
        Ok(self.manifests.get(code.as_str()).cloned().unwrap_or_default())
    }

    fn query_related(
        &self,
        code: &DatasetCode,
        kind: RelationKind,
    ) -> Result<Vec<RelationshipRecord>, ObisError> {
        self.calls.lock().unwrap().query_related += 1;
        if self.query_fails {
            return Err(ObisError::OpenbisRpc {
                method: "searchDataSets".to_string(),
                message: "unsupported criteria".to_string(),
            });
        }
        Ok(self
            .related
            .get(&(kind, code.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    fn traverse_related(
        &self,
        code: &DatasetCode,
        kind: RelationKind,
    ) -> Result<Vec<RelationshipRecord>, ObisError> {
        self.calls.lock().unwrap().traverse_related += 1;
        if self.traverse_fails {
            return Err(ObisError::DatasetNotFound(code.to_string()));
        }
        Ok(self
            .traversal
            .get(&(kind, code.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    fn download(
        &self,
        code: &DatasetCode,
        scope: TransferScope<'_>,
        destination: &Path,
    ) -> Result<(), ObisError> {
        let transfer = match scope {
            TransferScope::Full => Transfer::Full(code.to_string()),
            TransferScope::Files(paths) => Transfer::Files(code.to_string(), paths.to_vec()),
        };
        self.calls.lock().unwrap().transfers.push(transfer);
        if self.failing_downloads.iter().any(|failing| failing == code.as_str()) {
            return Err(ObisError::OpenbisStatus {
                status: 500,
                message: "transfer failed".to_string(),
            });
        }

        let manifest = self.manifests.get(code.as_str()).cloned().unwrap_or_default();
        match scope {
            TransferScope::Files(paths) => {
                for path in paths {
                    let size = manifest
                        .iter()
                        .find(|file| &file.path == path)
                        .and_then(|file| file.size)
                        .unwrap_or(1);
                    Self::write_file(destination, path, size)?;
                }
            }
            TransferScope::Full => {
                for path in &self.full_files {
                    Self::write_file(destination, path, 1)?;
                }
            }
        }
        Ok(())
    }

    fn create_dataset(&self, request: &NewDataset) -> Result<String, ObisError> {
        let mut calls = self.calls.lock().unwrap();
        calls.created.push(request.clone());
        Ok(format!("20250101000000000-{}", calls.created.len()))
    }
}

/// Collects progress messages for assertions.
#[derive(Default)]
pub struct RecordingSink {
    pub messages: Mutex<Vec<String>>,
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.messages.lock().unwrap().push(event.message);
    }
}
