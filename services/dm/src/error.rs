//! Deployment manager errors.

use fleet_model::ModelError;
use thiserror::Error;

use crate::targets::TargetError;

#[derive(Debug, Error)]
pub enum DmError {
    /// Unknown application, unknown instance path or malformed request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The target handler failed; the instance was rolled back.
    #[error("provisioning of {path} failed: {source}")]
    Provisioning {
        path: String,
        #[source]
        source: TargetError,
    },

    /// Some members of a bulk operation failed.
    #[error("{failed} of {total} operations failed")]
    Aggregate { failed: usize, total: usize },

    #[error("resource bundle error: {0}")]
    Resources(String),
}

impl From<ModelError> for DmError {
    fn from(e: ModelError) -> Self {
        DmError::InvalidArgument(e.to_string())
    }
}

impl DmError {
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, DmError::InvalidArgument(_))
    }
}
