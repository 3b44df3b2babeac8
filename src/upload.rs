use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::domain::CollectionPath;
use crate::error::ObisError;
use crate::metadata::{self, Metadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Fasta,
    SpectralLibrary,
    Unknown,
}

impl FileKind {
    pub fn detect(path: &Path) -> Self {
        let suffix = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase())
            .unwrap_or_default();
        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(|stem| stem.to_lowercase())
            .unwrap_or_default();

        match suffix.as_str() {
            "fasta" | "fa" | "fas" => FileKind::Fasta,
            "tsv" | "csv" if stem.contains("lib") => FileKind::SpectralLibrary,
            "speclib" | "sptxt" => FileKind::SpectralLibrary,
            _ => FileKind::Unknown,
        }
    }

    pub fn default_collection(&self) -> &'static str {
        match self {
            FileKind::Fasta => "/DDB/CK/FASTA",
            FileKind::SpectralLibrary => "/DDB/CK/PREDSPECLIB",
            FileKind::Unknown => "/DDB/CK/UNKNOWN",
        }
    }

    pub fn default_dataset_type(&self) -> &'static str {
        match self {
            FileKind::Fasta => "BIO_DB",
            FileKind::SpectralLibrary => "SPECTRAL_LIBRARY",
            FileKind::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FileKind::Fasta => "fasta",
            FileKind::SpectralLibrary => "spectral_library",
            FileKind::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub file: PathBuf,
    /// `None` means detect from the file name.
    pub kind: Option<FileKind>,
    pub collection: Option<CollectionPath>,
    pub dataset_type: Option<String>,
    pub name: Option<String>,
    pub version: Option<String>,
    pub log_file: Option<PathBuf>,
    pub notes: Option<String>,
    pub dry_run: bool,
}

/// Everything needed to create the dataset, computed without the server.
#[derive(Debug, Clone, Serialize)]
pub struct UploadPlan {
    pub file: PathBuf,
    pub kind: FileKind,
    pub collection: CollectionPath,
    pub dataset_type: String,
    pub name: String,
    pub metadata: Metadata,
    pub properties: BTreeMap<String, String>,
    pub additional_files: Vec<PathBuf>,
}

impl UploadPlan {
    pub fn files(&self) -> Vec<PathBuf> {
        std::iter::once(self.file.clone())
            .chain(self.additional_files.iter().cloned())
            .collect()
    }
}

/// Collection precedence: explicit request, then `fallback_collection`
/// (the configured default), then the per-kind default.
pub fn prepare(
    request: &UploadRequest,
    fallback_collection: Option<&CollectionPath>,
) -> Result<UploadPlan, ObisError> {
    if !request.file.is_file() {
        return Err(ObisError::UploadFileMissing(request.file.clone()));
    }

    let kind = request
        .kind
        .unwrap_or_else(|| FileKind::detect(&request.file));
    let collection = match (&request.collection, fallback_collection) {
        (Some(collection), _) => collection.clone(),
        (None, Some(collection)) => collection.clone(),
        (None, None) => kind.default_collection().parse()?,
    };
    let dataset_type = request
        .dataset_type
        .clone()
        .map(|dataset_type| dataset_type.to_uppercase())
        .unwrap_or_else(|| kind.default_dataset_type().to_string());

    let log_file = request
        .log_file
        .as_ref()
        .filter(|path| path.is_file())
        .cloned();
    if let Some(missing) = request.log_file.as_ref().filter(|path| !path.is_file()) {
        tracing::warn!(path = %missing.display(), "log file not found; continuing without it");
    }

    let metadata = match kind {
        FileKind::Fasta => {
            metadata::parse_fasta_metadata(&request.file, request.version.as_deref())
                .unwrap_or_else(|err| {
                    tracing::warn!(%err, "could not parse FASTA file");
                    Metadata::new()
                })
        }
        FileKind::SpectralLibrary => match &log_file {
            Some(log) => metadata::parse_diann_log(log).unwrap_or_else(|err| {
                tracing::warn!(%err, "could not parse DIA-NN log file");
                Metadata::new()
            }),
            None => Metadata::new(),
        },
        FileKind::Unknown => Metadata::new(),
    };

    let name = generate_name(kind, &request.file, &metadata, request.name.as_deref());
    let properties = build_properties(&dataset_type, &name, &metadata, request.notes.as_deref());
    let additional_files = match kind {
        FileKind::SpectralLibrary => log_file.into_iter().collect(),
        _ => Vec::new(),
    };

    Ok(UploadPlan {
        file: request.file.clone(),
        kind,
        collection,
        dataset_type,
        name,
        metadata,
        properties,
        additional_files,
    })
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub fn generate_name(
    kind: FileKind,
    file: &Path,
    metadata: &Metadata,
    custom_name: Option<&str>,
) -> String {
    if let Some(name) = custom_name.filter(|name| !name.trim().is_empty()) {
        return name.to_string();
    }

    match kind {
        FileKind::Fasta => {
            let mut name = file_stem(file);
            if let Some(version) = metadata.get("VERSION") {
                name.push_str(&format!(" v{version}"));
            }
            if let Some(species) = metadata.get("PRIMARY_SPECIES") {
                name.push_str(&format!(" ({species})"));
            }
            name
        }
        FileKind::SpectralLibrary => {
            let mut parts = vec![file_stem(file)];
            if let Some(fasta) = metadata.get("FASTA_DATABASE") {
                parts.push(format!("({})", file_stem(Path::new(&fasta.to_string()))));
            }
            if let Some(proteins) = metadata.get("N_PROTEINS") {
                parts.push(format!("{proteins} proteins"));
            }
            if let Some(version) = metadata.get("DIANN_VERSION") {
                parts.push(format!("DIA-NN v{version}"));
            }
            parts.join(" ")
        }
        FileKind::Unknown => file_stem(file),
    }
}

/// OpenBIS property values for a dataset of `dataset_type`.
///
/// `BIO_DB` datasets carry no `notes` property. For `SPECTRAL_LIBRARY`, which
/// has no `$name`, the name goes into `notes` unless the built notes replace it.
pub fn build_properties(
    dataset_type: &str,
    name: &str,
    metadata: &Metadata,
    user_notes: Option<&str>,
) -> BTreeMap<String, String> {
    let mut props = BTreeMap::new();
    match dataset_type {
        "BIO_DB" => {
            props.insert("$name".to_string(), name.to_string());
            if let Some(version) = metadata.get("VERSION") {
                props.insert("version".to_string(), version.to_string());
            }
            if let Some(description) = comprehensive_description(metadata) {
                props.insert("product.description".to_string(), description);
            }
        }
        "SPECTRAL_LIBRARY" => {
            props.insert("notes".to_string(), name.to_string());
            if let Some(proteins) = metadata.get("N_PROTEINS") {
                props.insert("n_proteins".to_string(), proteins.to_string());
            }
            if let Some(precursors) = metadata.get("N_PRECURSORS") {
                props.insert("n_peptides".to_string(), precursors.to_string());
            }
        }
        _ => {
            props.insert("$name".to_string(), name.to_string());
        }
    }

    if dataset_type != "BIO_DB" {
        if let Some(notes) = build_notes(user_notes, metadata) {
            props.insert("notes".to_string(), notes);
        }
    }
    props
}

pub fn comprehensive_description(metadata: &Metadata) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(entries) = metadata.get("N_ENTRIES") {
        parts.push(format!("{entries} entries"));
    }
    if let Some(species) = metadata.get("PRIMARY_SPECIES") {
        parts.push(format!("Primary species: {species}"));
    }
    if let Some(count) = metadata.get("SPECIES_COUNT") {
        parts.push(format!("{count} species"));
    }
    if let Some(size) = metadata.get("FILE_SIZE_MB") {
        parts.push(format!("{size} MB"));
    }
    (!parts.is_empty()).then(|| parts.join(" | "))
}

pub fn build_notes(user_notes: Option<&str>, metadata: &Metadata) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(notes) = user_notes.filter(|notes| !notes.is_empty()) {
        parts.push(format!("Description: {notes}"));
    }
    parts.extend(
        metadata
            .iter()
            .filter(|(key, _)| !matches!(*key, "VERSION" | "N_ENTRIES"))
            .map(|(key, value)| format!("{key}: {value}")),
    );
    (!parts.is_empty()).then(|| parts.join(" | "))
}
