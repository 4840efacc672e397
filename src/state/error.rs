use thiserror::Error;

use crate::docker::DockerError;
use crate::logview::LogViewError;
use crate::store::StoreError;

/// Rejection of a pushed declared-state document, with a reason precise
/// enough for the operator on the other side of the controller.
#[derive(Error, Debug, PartialEq)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error(transparent)]
    LogView(#[from] LogViewError),

    #[error("no running services named '{0}'")]
    NoSuchService(String),

    #[error(
        "no compose services found; this usually means the compose file is \
         mounted on a path that does not match the path on the host"
    )]
    NoServices,

    #[error("invalid request: {0}")]
    BadRequest(String),
}
