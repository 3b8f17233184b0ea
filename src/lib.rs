//! Offline-tolerant core of a manufacturing-execution client.
//!
//! Two subsystems keep operator actions correct and eventually durable on an
//! unreliable factory-floor network:
//!
//! - [`flow`] derives per-step status and the single actionable step from a
//!   unit's server-supplied process history.
//! - [`queue`] and [`sync`] capture start/complete requests produced while
//!   disconnected and drain them to the server strictly in submission order.
//!
//! [`network`] turns raw reachability samples into debounced connectivity
//! events, and [`station`] ties everything together behind an operator-facing
//! facade.

pub mod config;
pub mod error;
pub mod flow;
pub mod network;
pub mod queue;
pub mod server;
pub mod station;
pub mod sync;
pub mod telemetry;

pub use config::FloorConfig;
pub use error::{FailureKind, FloorError};
pub use flow::{
    FlowSnapshot, PreconditionError, Process, ProcessFlowEngine, ProcessHistoryEntry,
    ProcessResult, ProcessStatus, WipTrace,
};
pub use network::{Connectivity, NetworkMonitor};
pub use queue::{OpId, OpStatus, OperationKind, OperationQueue, QueuedOperation};
pub use server::{ApiError, HttpServerClient, ServerApi};
pub use station::{OperatorSession, Station, Submission};
pub use sync::{FlushOutcome, RetryPolicy, SyncCoordinator, SyncStatus};
