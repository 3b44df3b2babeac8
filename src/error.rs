use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ObisError {
    #[error("invalid dataset code: {0}")]
    InvalidDatasetCode(String),

    #[error("invalid collection path: {0}")]
    InvalidCollectionPath(String),

    #[error("invalid relation kind: {0}")]
    InvalidRelationKind(String),

    #[error("unknown config key: {0}")]
    InvalidConfigKey(String),

    #[error("invalid value for {key}: {value}")]
    InvalidConfigValue { key: String, value: String },

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("missing OpenBIS credentials: {0}")]
    #[diagnostic(help("set OPENBIS_URL, OPENBIS_USERNAME and OPENBIS_PASSWORD or write ~/.openbis/credentials"))]
    MissingCredentials(String),

    #[error("failed to read credentials file at {0}")]
    CredentialsRead(PathBuf),

    #[error("OpenBIS request failed: {0}")]
    OpenbisHttp(String),

    #[error("OpenBIS returned status {status}: {message}")]
    OpenbisStatus { status: u16, message: String },

    #[error("OpenBIS rejected {method}: {message}")]
    OpenbisRpc { method: String, message: String },

    #[error("OpenBIS login failed: {0}")]
    Authentication(String),

    #[error("dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("sample not found: {0}")]
    SampleNotFound(String),

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("download of {0} completed but no files found")]
    EmptyDownload(String),

    #[error("{failed} of {total} datasets in {collection} failed to download")]
    CollectionIncomplete {
        collection: String,
        failed: usize,
        total: usize,
    },

    #[error("failed to extract metadata: {0}")]
    Metadata(String),

    #[error("file not found: {0}")]
    UploadFileMissing(PathBuf),

    #[error("nothing to show (pass --spaces, --dataset or --sample)")]
    NothingRequested,

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
