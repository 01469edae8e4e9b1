//! Error types for buildrun.

use thiserror::Error;

use crate::build::BuildPhase;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid phase transition for {build}: {from} -> {to}")]
    InvalidTransition {
        build: String,
        from: BuildPhase,
        to: BuildPhase,
    },

    /// The operation can never succeed, no matter how often it is retried.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("api error: {0}")]
    Api(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("serialization: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
