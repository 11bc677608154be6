use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FileshareError>;

#[derive(Error, Debug)]
pub enum FileshareError {
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame exceeds the maximum allowed size")]
    FrameTooLarge,

    #[error("Timed out while {0}")]
    Timeout(&'static str),

    #[error("File operation error: {0}")]
    FileOperation(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Failed to send part {part_index} of {path:?}: {source}")]
    PartFailed {
        path: PathBuf,
        part_index: u32,
        #[source]
        source: Box<FileshareError>,
    },
}

impl FileshareError {
    pub fn part_failed(path: impl Into<PathBuf>, part_index: u32, source: FileshareError) -> Self {
        FileshareError::PartFailed {
            path: path.into(),
            part_index,
            source: Box::new(source),
        }
    }
}
