use thiserror::Error;

/// Errors raised by model lookups and edits.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("no instance at path {0}")]
    InstanceNotFound(String),

    #[error("an instance already exists at path {0}")]
    DuplicateInstance(String),

    #[error("invalid instance path: {0}")]
    InvalidPath(String),

    #[error("instance {path} cannot be removed while it is {status}")]
    StillDeployed { path: String, status: String },

    #[error("instance {0} is not a scoped instance")]
    NotScoped(String),
}
