use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::cache::{Clock, RelationshipCache, SystemClock};
use crate::domain::{CollectionPath, DatasetCode, RelationKind, SearchTarget};
use crate::error::ObisError;
use crate::fs_util;
use crate::openbis::{
    DatasetInfo, EntitySummary, NewDataset, OpenbisClient, SampleInfo, SpaceSummary,
    TransferScope,
};
use crate::reconcile::{self, PlannedFile, ReconcileOptions, RemoteFileDescriptor};
use crate::relations::{self, RelationGraph};
use crate::upload::{self, UploadPlan, UploadRequest};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

impl ProgressEvent {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            elapsed: None,
        }
    }

    pub fn timed(message: impl Into<String>, started: Instant) -> Self {
        Self {
            message: message.into(),
            elapsed: Some(started.elapsed()),
        }
    }
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectResult {
    pub space_count: usize,
    pub spaces: Vec<SpaceSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHits {
    pub total: usize,
    pub items: Vec<EntitySummary>,
}

impl SearchHits {
    fn truncated(items: Vec<EntitySummary>, limit: usize) -> Self {
        let total = items.len();
        Self {
            total,
            items: items.into_iter().take(limit).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub query: String,
    pub target: SearchTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experiments: Option<SearchHits>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub samples: Option<SearchHits>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datasets: Option<SearchHits>,
    /// Per-kind searches that failed; the others still report results.
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileListResult {
    pub code: String,
    pub files: Vec<RemoteFileDescriptor>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadOptions {
    pub force: bool,
    pub verify_checksum: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadAction {
    /// Every manifest entry was already present locally.
    UpToDate,
    Incremental,
    /// The manifest could not be read, so the whole dataset was requested.
    Full,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadResult {
    pub code: String,
    pub destination: String,
    pub action: DownloadAction,
    pub fetched: Vec<PlannedFile>,
    pub skipped: Vec<PlannedFile>,
    pub file_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionListResult {
    pub collection: String,
    pub total: usize,
    pub datasets: Vec<EntitySummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionFailure {
    pub code: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionDownloadResult {
    pub collection: String,
    pub output_dir: String,
    pub total: usize,
    pub attempted: usize,
    pub downloads: Vec<DownloadResult>,
    pub failures: Vec<CollectionFailure>,
}

impl CollectionDownloadResult {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SpaceDetails {
    pub code: String,
    pub description: Option<String>,
    pub projects: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetDetails {
    #[serde(flatten)]
    pub info: DatasetInfo,
    pub files: Option<Vec<RemoteFileDescriptor>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleDetails {
    #[serde(flatten)]
    pub info: SampleInfo,
    pub datasets: Option<Vec<EntitySummary>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InfoRequest {
    pub spaces: bool,
    pub dataset: Option<DatasetCode>,
    pub sample: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InfoResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spaces: Option<Vec<SpaceDetails>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<DatasetDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample: Option<SampleDetails>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadResult {
    pub dry_run: bool,
    pub dataset_code: Option<String>,
    #[serde(flatten)]
    pub plan: UploadPlan,
}

/// Operations of the toolkit over one OpenBIS client and one relationship
/// cache. The cache lives as long as the `App`, i.e. one CLI invocation.
pub struct App<C: OpenbisClient, K: Clock = SystemClock> {
    client: C,
    cache: RelationshipCache<K>,
}

impl<C: OpenbisClient> App<C, SystemClock> {
    pub fn new(client: C, cache_expiry: Duration) -> Self {
        Self::with_cache(client, RelationshipCache::with_clock(SystemClock, cache_expiry))
    }
}

impl<C: OpenbisClient, K: Clock> App<C, K> {
    pub fn with_cache(client: C, cache: RelationshipCache<K>) -> Self {
        Self { client, cache }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn cache(&self) -> &RelationshipCache<K> {
        &self.cache
    }

    pub fn connect(&self, verbose: bool, sink: &dyn ProgressSink) -> Result<ConnectResult, ObisError> {
        let started = Instant::now();
        sink.event(ProgressEvent::message("connecting to OpenBIS"));
        let spaces = self.client.list_spaces()?;
        sink.event(ProgressEvent::timed(
            format!("connected; {} spaces visible", spaces.len()),
            started,
        ));
        Ok(ConnectResult {
            space_count: spaces.len(),
            spaces: if verbose { spaces } else { Vec::new() },
        })
    }

    pub fn search(
        &self,
        query: &str,
        target: SearchTarget,
        limit: usize,
        sink: &dyn ProgressSink,
    ) -> Result<SearchResult, ObisError> {
        let mut result = SearchResult {
            query: query.to_string(),
            target,
            experiments: None,
            samples: None,
            datasets: None,
            errors: Vec::new(),
        };

        let searches: [(SearchTarget, &str, fn(&C, &str) -> Result<Vec<EntitySummary>, ObisError>); 3] = [
            (SearchTarget::Experiments, "experiments", C::search_experiments),
            (SearchTarget::Samples, "samples", C::search_samples),
            (SearchTarget::Datasets, "datasets", C::search_datasets),
        ];
        for (kind, label, search) in searches {
            if !target.includes(kind) {
                continue;
            }
            sink.event(ProgressEvent::message(format!("searching {label} for {query}")));
            match search(&self.client, query) {
                Ok(items) => {
                    let hits = Some(SearchHits::truncated(items, limit));
                    match kind {
                        SearchTarget::Experiments => result.experiments = hits,
                        SearchTarget::Samples => result.samples = hits,
                        _ => result.datasets = hits,
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, label, "search failed");
                    result.errors.push(format!("{label}: {err}"));
                }
            }
        }
        Ok(result)
    }

    pub fn list_dataset_files(
        &self,
        code: &DatasetCode,
        sink: &dyn ProgressSink,
    ) -> Result<FileListResult, ObisError> {
        sink.event(ProgressEvent::message(format!("listing files of {code}")));
        self.require_dataset(code)?;
        let files = self.client.list_files(code)?;
        Ok(FileListResult {
            code: code.to_string(),
            files,
        })
    }

    /// Brings `<output_dir>/<code>` up to date with the dataset on the server.
    pub fn download_dataset(
        &self,
        code: &DatasetCode,
        output_dir: &Path,
        options: DownloadOptions,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadResult, ObisError> {
        let started = Instant::now();
        self.require_dataset(code)?;
        let destination = output_dir.join(code.as_str());

        let (action, fetched, skipped) = match self.client.list_files(code) {
            Ok(manifest) => {
                let plan = reconcile::plan(
                    &destination,
                    &manifest,
                    ReconcileOptions {
                        force: options.force,
                        verify_checksum: options.verify_checksum,
                    },
                );
                sink.event(ProgressEvent::message(format!(
                    "{code}: {} to fetch, {} up to date",
                    plan.fetch.len(),
                    plan.skip.len()
                )));
                if plan.is_complete() {
                    (DownloadAction::UpToDate, plan.fetch, plan.skip)
                } else {
                    let paths = plan.fetch_paths();
                    self.client
                        .download(code, TransferScope::Files(&paths), &destination)?;
                    (DownloadAction::Incremental, plan.fetch, plan.skip)
                }
            }
            Err(err) => {
                tracing::warn!(dataset = %code, %err, "file manifest unavailable; downloading everything");
                sink.event(ProgressEvent::message(format!("{code}: full download")));
                self.client.download(code, TransferScope::Full, &destination)?;
                (DownloadAction::Full, Vec::new(), Vec::new())
            }
        };

        let file_count = fs_util::count_files(&destination)?;
        if file_count == 0 {
            return Err(ObisError::EmptyDownload(code.to_string()));
        }
        sink.event(ProgressEvent::timed(
            format!("{code}: {file_count} files in {}", destination.display()),
            started,
        ));
        Ok(DownloadResult {
            code: code.to_string(),
            destination: destination.display().to_string(),
            action,
            fetched,
            skipped,
            file_count,
        })
    }

    pub fn list_collection(
        &self,
        collection: &CollectionPath,
        limit: Option<usize>,
        sink: &dyn ProgressSink,
    ) -> Result<CollectionListResult, ObisError> {
        sink.event(ProgressEvent::message(format!("listing {collection}")));
        let datasets = self.collection_datasets(collection)?;
        let total = datasets.len();
        Ok(CollectionListResult {
            collection: collection.to_string(),
            total,
            datasets: datasets.into_iter().take(limit.unwrap_or(total)).collect(),
        })
    }

    /// Downloads each dataset of the collection in turn. A failing dataset is
    /// recorded and the batch moves on.
    pub fn download_collection(
        &self,
        collection: &CollectionPath,
        output_dir: &Path,
        limit: Option<usize>,
        options: DownloadOptions,
        sink: &dyn ProgressSink,
    ) -> Result<CollectionDownloadResult, ObisError> {
        let datasets = self.collection_datasets(collection)?;
        let total = datasets.len();
        let selected = datasets
            .into_iter()
            .take(limit.unwrap_or(total))
            .collect::<Vec<_>>();
        let attempted = selected.len();

        let mut result = CollectionDownloadResult {
            collection: collection.to_string(),
            output_dir: output_dir.display().to_string(),
            total,
            attempted,
            downloads: Vec::new(),
            failures: Vec::new(),
        };

        for (index, dataset) in selected.iter().enumerate() {
            sink.event(ProgressEvent::message(format!(
                "[{}/{attempted}] {}",
                index + 1,
                dataset.code
            )));
            let outcome = dataset
                .code
                .parse::<DatasetCode>()
                .and_then(|code| self.download_dataset(&code, output_dir, options, sink));
            match outcome {
                Ok(download) => result.downloads.push(download),
                Err(err) => {
                    tracing::warn!(dataset = %dataset.code, %err, "dataset download failed");
                    result.failures.push(CollectionFailure {
                        code: dataset.code.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok(result)
    }

    pub fn info(&self, request: &InfoRequest, sink: &dyn ProgressSink) -> Result<InfoResult, ObisError> {
        if !request.spaces && request.dataset.is_none() && request.sample.is_none() {
            return Err(ObisError::NothingRequested);
        }
        let mut result = InfoResult::default();

        if request.spaces {
            sink.event(ProgressEvent::message("loading spaces"));
            let spaces = self.client.list_spaces()?;
            result.spaces = Some(
                spaces
                    .into_iter()
                    .map(|space| {
                        let projects = self
                            .client
                            .count_projects(&space.code)
                            .inspect_err(|err| {
                                tracing::warn!(space = %space.code, %err, "could not count projects");
                            })
                            .ok();
                        SpaceDetails {
                            code: space.code,
                            description: space.description,
                            projects,
                        }
                    })
                    .collect(),
            );
        }

        if let Some(code) = &request.dataset {
            sink.event(ProgressEvent::message(format!("loading dataset {code}")));
            let info = self.require_dataset(code)?;
            let files = self
                .client
                .list_files(code)
                .inspect_err(|err| tracing::warn!(dataset = %code, %err, "could not list files"))
                .ok();
            result.dataset = Some(DatasetDetails { info, files });
        }

        if let Some(code) = &request.sample {
            sink.event(ProgressEvent::message(format!("loading sample {code}")));
            let info = self
                .client
                .get_sample(code)?
                .ok_or_else(|| ObisError::SampleNotFound(code.clone()))?;
            let datasets = self
                .client
                .sample_datasets(code)
                .inspect_err(|err| tracing::warn!(sample = %code, %err, "could not list datasets"))
                .ok();
            result.sample = Some(SampleDetails { info, datasets });
        }
        Ok(result)
    }

    /// Relationship graph of `code` up to `depth` hops, served through the
    /// relationship cache.
    pub fn relations(
        &mut self,
        code: &DatasetCode,
        kinds: &[RelationKind],
        depth: usize,
        sink: &dyn ProgressSink,
    ) -> Result<RelationGraph, ObisError> {
        sink.event(ProgressEvent::message(format!("resolving relations of {code}")));
        let graph = relations::walk(&self.client, &mut self.cache, code, kinds, depth.max(1));
        sink.event(ProgressEvent::message(format!(
            "{} related datasets; {} cached lookups",
            graph.edges.len(),
            self.cache.len()
        )));
        Ok(graph)
    }

    pub fn upload(
        &self,
        request: &UploadRequest,
        fallback_collection: Option<&CollectionPath>,
        sink: &dyn ProgressSink,
    ) -> Result<UploadResult, ObisError> {
        let plan = upload::prepare(request, fallback_collection)?;
        sink.event(ProgressEvent::message(format!(
            "{} as {} into {} ({} metadata fields)",
            plan.kind,
            plan.dataset_type,
            plan.collection,
            plan.metadata.len()
        )));
        if request.dry_run {
            return Ok(UploadResult {
                dry_run: true,
                dataset_code: None,
                plan,
            });
        }

        let started = Instant::now();
        let files: Vec<PathBuf> = plan.files();
        let code = self.client.create_dataset(&NewDataset {
            dataset_type: plan.dataset_type.clone(),
            collection: plan.collection.clone(),
            files,
            properties: plan.properties.clone(),
        })?;
        sink.event(ProgressEvent::timed(format!("created dataset {code}"), started));
        Ok(UploadResult {
            dry_run: false,
            dataset_code: Some(code),
            plan,
        })
    }

    fn require_dataset(&self, code: &DatasetCode) -> Result<DatasetInfo, ObisError> {
        self.client
            .get_dataset(code)?
            .ok_or_else(|| ObisError::DatasetNotFound(code.to_string()))
    }

    fn collection_datasets(
        &self,
        collection: &CollectionPath,
    ) -> Result<Vec<EntitySummary>, ObisError> {
        if !self.client.collection_exists(collection)? {
            return Err(ObisError::CollectionNotFound(collection.to_string()));
        }
        self.client.collection_datasets(collection)
    }
}
