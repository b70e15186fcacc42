use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigValidationError),
    #[error("'userId' is not defined for the path '{}'", root.display())]
    MissingUser { root: PathBuf },
    #[error("catalog error: {0}")]
    Catalog(String),
    #[error("queue error: {0}")]
    Queue(String),
    #[error("watch error: {0}")]
    Watch(String),
    #[error("service error: {0}")]
    Service(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T, E = TrackerError> = std::result::Result<T, E>;
