use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::server::{CompleteRequest, StartRequest};

/// Client-generated identifier of a logical request. Stable across retries
/// and sent to the server as the idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpId(Uuid);

impl OpId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OpId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for OpId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Start,
    Complete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Start => write!(f, "START"),
            OperationKind::Complete => write!(f, "COMPLETE"),
        }
    }
}

/// Lifecycle of a queued operation. Acknowledged operations are removed, so
/// there is no terminal success state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpStatus {
    Pending,
    InFlight,
    Failed,
}

impl fmt::Display for OpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpStatus::Pending => write!(f, "PENDING"),
            OpStatus::InFlight => write!(f, "IN_FLIGHT"),
            OpStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// What `mark_failed` should do with an operation after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Leave it `PENDING` for the next attempt.
    Retry,
    /// Park it as `FAILED` until the operator retries or discards it.
    Park,
}

/// The request body of a queued operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationRequest {
    Start(StartRequest),
    Complete(CompleteRequest),
}

impl OperationRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationRequest::Start(_) => OperationKind::Start,
            OperationRequest::Complete(_) => OperationKind::Complete,
        }
    }

    pub fn wip_id(&self) -> &str {
        match self {
            OperationRequest::Start(req) => &req.wip_id,
            OperationRequest::Complete(req) => &req.wip_id,
        }
    }

    pub fn process_id(&self) -> &str {
        match self {
            OperationRequest::Start(req) => &req.process_id,
            OperationRequest::Complete(req) => &req.process_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedOperation {
    pub op_id: OpId,
    pub request: OperationRequest,
    pub created_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub status: OpStatus,
    pub last_error: Option<String>,
}

impl QueuedOperation {
    pub fn new(op_id: OpId, request: OperationRequest) -> Self {
        Self {
            op_id,
            request,
            created_at: Utc::now(),
            attempt_count: 0,
            status: OpStatus::Pending,
            last_error: None,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.request.kind()
    }
}
