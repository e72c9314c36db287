use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Cannot create work directory {path}: {source}")]
    WorkPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
