use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackrError {
    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("unknown object: {0}")]
    UnknownObject(String),

    #[error("name already in use: {0}")]
    DuplicateName(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("timed out waiting for task result")]
    WaitTimeout,

    #[error("engine is shutting down")]
    Shutdown,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl TrackrError {
    /// Wrap any backend error as a transient storage failure.
    pub fn storage(e: impl std::fmt::Display) -> Self {
        Self::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TrackrError>;
