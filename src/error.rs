use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no objects found under {prefix} in {location}")]
    EmptyListing { location: String, prefix: String },

    #[error("listing {prefix} failed: {message}")]
    Listing { prefix: String, message: String },

    #[error("storage request for {key} failed: {message}")]
    Storage { key: String, message: String },

    #[error("cannot derive an accession from key: {0}")]
    InvalidKey(String),

    #[error("MD5 mismatch for {key}: expected {expected}, got {actual}")]
    Checksum {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("filesystem error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to launch {tool}: {source}")]
    ToolSpawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with {status} for {accession}")]
    ToolFailed {
        tool: String,
        accession: String,
        status: String,
    },

    #[error("{accession}: expected output missing: {path}")]
    MissingOutput { accession: String, path: PathBuf },

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    /// Errors that abort the whole run. Everything else only costs one
    /// object, one accession, or one batch step.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::EmptyListing { .. }
                | PipelineError::Listing { .. }
                | PipelineError::MissingTool(_)
                | PipelineError::Config(_)
        )
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
