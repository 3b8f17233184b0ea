use thiserror::Error;

use crate::flow::{CatalogError, PreconditionError};
use crate::queue::{DurabilityError, OpId, OpStatus};
use crate::server::ApiError;

#[derive(Debug, Error)]
pub enum FloorError {
    #[error("Action rejected: {0}")]
    Precondition(#[from] PreconditionError),

    #[error("Invalid process catalog: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Server error: {0}")]
    Api(#[from] ApiError),

    #[error("Local queue storage failed: {0}")]
    Durability(#[from] DurabilityError),

    #[error("Queued operation not found: {0}")]
    OperationNotFound(OpId),

    #[error("Operation {op_id} is {status} and cannot be {action}")]
    InvalidQueueState {
        op_id: OpId,
        status: OpStatus,
        action: &'static str,
    },
}

/// Classifies a server-side failure for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// Timeout, connection failure or overloaded server; worth retrying.
    Transient,
    /// Definitive business-rule or validation rejection; never retried.
    Rejection,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "Transient"),
            FailureKind::Rejection => write!(f, "Rejection"),
        }
    }
}
