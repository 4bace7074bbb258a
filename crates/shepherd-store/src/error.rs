use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("team not found: {0}")]
    TeamNotFound(String),

    #[error("duplicate command uuid: {0}")]
    DuplicateCommand(String),

    #[error("an EULA already exists for this scope")]
    EulaExists,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal store error: {0}")]
    Internal(String),
}
