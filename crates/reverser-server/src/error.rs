//! Reconciler-facing error type: everything a controller's `reconcile` can
//! fail with, surfaced through `error_policy`.

use reverser_core::{ConfigConflict, GitError, ValidationError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("kube api error: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    ConfigConflict(#[from] ConfigConflict),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error("object {0} is missing a namespace")]
    MissingNamespace(String),

    #[error("object {0} is missing a uid")]
    MissingUid(String),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Other(err.to_string())
    }
}
