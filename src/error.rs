use std::path::PathBuf;

use thiserror::Error;

use crate::cache::CacheError;
use crate::digest::Digest;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("root value in config missing")]
    MissingRoot,

    #[error("cas_cache_directory value in config missing")]
    MissingCasCacheDirectory,

    #[error("failed to read config {path:?}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path:?}: {source}")]
    ConfigParse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("blob not found: {0}")]
    BlobNotFound(Digest),

    #[error("directory {0} missing from input tree")]
    MissingDirectory(Digest),

    #[error("declared output directory not supported: {0}")]
    OutputDirectoryUnsupported(String),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
