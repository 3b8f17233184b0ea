use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::error::FloorError;
use crate::flow::{FlowSnapshot, ProcessFlowEngine, ProcessResult, WipTrace};
use crate::network::Connectivity;
use crate::queue::{OpId, OperationQueue, OperationRequest};
use crate::server::{
    ApiError, CompleteRequest, DefectRecord, Measurement, ServerApi, StartRequest,
};
use crate::sync::SyncCoordinator;

/// Who is operating the station. Passed in explicitly; nothing in the core
/// reads operator identity from global state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorSession {
    pub worker_id: String,
    pub equipment_id: Option<String>,
    pub line_id: Option<String>,
}

impl OperatorSession {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            equipment_id: None,
            line_id: None,
        }
    }
}

/// Operator input for completing a step.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionInput {
    pub result: ProcessResult,
    pub measurements: Vec<Measurement>,
    pub defect_data: Vec<DefectRecord>,
}

impl CompletionInput {
    pub fn new(result: ProcessResult) -> Self {
        Self {
            result,
            measurements: Vec::new(),
            defect_data: Vec::new(),
        }
    }
}

/// How an accepted operator action was handed off.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Acknowledged by the server right away. `trace` is the refreshed
    /// history when the follow-up fetch succeeded.
    Sent {
        op_id: OpId,
        trace: Option<WipTrace>,
    },
    /// Stored in the offline queue for a later flush.
    Queued { op_id: OpId },
}

impl Submission {
    pub fn op_id(&self) -> OpId {
        match self {
            Submission::Sent { op_id, .. } | Submission::Queued { op_id } => *op_id,
        }
    }
}

/// Operator-facing entry point: validates an action against the flow, then
/// sends it directly or parks it in the queue.
pub struct Station<A> {
    session: OperatorSession,
    engine: ProcessFlowEngine,
    api: Arc<A>,
    queue: OperationQueue,
    coordinator: Arc<SyncCoordinator<A>>,
    connectivity: watch::Receiver<Connectivity>,
}

impl<A: ServerApi + 'static> Station<A> {
    pub fn new(
        session: OperatorSession,
        engine: ProcessFlowEngine,
        api: Arc<A>,
        coordinator: Arc<SyncCoordinator<A>>,
        connectivity: watch::Receiver<Connectivity>,
    ) -> Self {
        let queue = coordinator.queue().clone();
        Self {
            session,
            engine,
            api,
            queue,
            coordinator,
            connectivity,
        }
    }

    pub fn session(&self) -> &OperatorSession {
        &self.session
    }

    pub fn engine(&self) -> &ProcessFlowEngine {
        &self.engine
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.borrow().is_online()
    }

    /// Fetches the unit's current history from the server.
    pub async fn refresh(&self, wip_id: &str) -> Result<WipTrace, FloorError> {
        let request_timeout = self.coordinator.policy().request_timeout;
        let trace = timeout(request_timeout, self.api.fetch_trace(wip_id))
            .await
            .unwrap_or(Err(ApiError::Timeout))?;
        Ok(trace)
    }

    /// The trace as the operator should see it: server history plus this
    /// device's not-yet-acknowledged operations.
    pub async fn snapshot(&self, trace: &WipTrace) -> FlowSnapshot {
        self.engine.evaluate(&self.projected(trace).await)
    }

    pub async fn start_process(
        &self,
        trace: &WipTrace,
        process_number: u32,
    ) -> Result<Submission, FloorError> {
        self.snapshot(trace)
            .await
            .ensure_can_start(process_number)?;
        let process = self.engine.process(process_number)?;
        let request = OperationRequest::Start(StartRequest {
            wip_id: trace.wip_id.clone(),
            process_id: process.process_id.clone(),
            worker_id: self.session.worker_id.clone(),
            equipment_id: self.session.equipment_id.clone(),
            line_id: self.session.line_id.clone(),
        });
        self.submit(request).await
    }

    pub async fn complete_process(
        &self,
        trace: &WipTrace,
        process_number: u32,
        input: CompletionInput,
    ) -> Result<Submission, FloorError> {
        self.snapshot(trace)
            .await
            .ensure_can_complete(process_number)?;
        let process = self.engine.process(process_number)?;
        let request = OperationRequest::Complete(CompleteRequest {
            wip_id: trace.wip_id.clone(),
            process_id: process.process_id.clone(),
            worker_id: self.session.worker_id.clone(),
            result: input.result,
            measurements: input.measurements,
            defect_data: input.defect_data,
        });
        self.submit(request).await
    }

    async fn projected(&self, trace: &WipTrace) -> WipTrace {
        let queued = self.queue.pending_for(&trace.wip_id).await;
        self.engine.project(trace, &queued)
    }

    /// Sends directly only when online with nothing older queued, so the
    /// device-wide FIFO order is never bypassed.
    async fn submit(&self, request: OperationRequest) -> Result<Submission, FloorError> {
        let op_id = OpId::new();
        let wip_id = request.wip_id().to_string();

        if self.is_online() && self.queue.is_empty().await {
            let request_timeout = self.coordinator.policy().request_timeout;
            let sent = timeout(request_timeout, self.api.submit(op_id, &request))
                .await
                .unwrap_or(Err(ApiError::Timeout));
            match sent {
                Ok(_) => {
                    info!(%op_id, kind = %request.kind(), "Operation sent directly");
                    let trace = match self.refresh(&wip_id).await {
                        Ok(trace) => Some(trace),
                        Err(e) => {
                            warn!(%wip_id, error = %e, "Trace refresh after send failed");
                            None
                        }
                    };
                    return Ok(Submission::Sent { op_id, trace });
                }
                Err(e) if e.is_transient() => {
                    // Same op_id, so a send that actually landed is deduplicated.
                    warn!(%op_id, error = %e, "Direct send failed, queueing");
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.queue.enqueue_with_id(op_id, request).await?;
        if self.is_online() {
            self.coordinator.spawn_flush();
        }
        Ok(Submission::Queued { op_id })
    }
}
