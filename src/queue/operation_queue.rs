use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tracing::{info, warn};

use super::operation::{FailureDisposition, OpId, OpStatus, OperationRequest, QueuedOperation};
use super::store::{DurabilityError, QueueStore};
use crate::error::FloorError;

/// Counters published on every queue mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub depth: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub failed: usize,
}

impl QueueStats {
    fn of(ops: &[QueuedOperation]) -> Self {
        let count = |status: OpStatus| ops.iter().filter(|op| op.status == status).count();
        Self {
            depth: ops.len(),
            pending: count(OpStatus::Pending),
            in_flight: count(OpStatus::InFlight),
            failed: count(OpStatus::Failed),
        }
    }
}

struct Shared {
    ops: Mutex<Vec<QueuedOperation>>,
    store: Box<dyn QueueStore>,
    stats: watch::Sender<QueueStats>,
}

/// Durable FIFO of start/complete requests awaiting server acknowledgment.
///
/// Every mutation is applied to a copy, persisted, and only then made
/// visible; a failed write leaves the queue exactly as it was. Callers that
/// arrive while a write is running wait their turn on the internal lock.
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct OperationQueue {
    shared: Arc<Shared>,
}

impl OperationQueue {
    /// Loads the persisted queue. Operations left `IN_FLIGHT` by a crash are
    /// returned to `PENDING`; resending them is safe because the server
    /// deduplicates on `op_id`.
    pub async fn open(store: impl QueueStore + 'static) -> Result<Self, DurabilityError> {
        let mut ops = store.load().await?;
        let mut recovered = 0;
        for op in ops.iter_mut().filter(|op| op.status == OpStatus::InFlight) {
            op.status = OpStatus::Pending;
            recovered += 1;
        }
        if recovered > 0 {
            warn!(recovered, "Recovered operations interrupted mid-delivery");
            store.persist(&ops).await?;
        }
        info!(operations = ops.len(), "Operation queue opened");

        let (stats, _) = watch::channel(QueueStats::of(&ops));
        Ok(Self {
            shared: Arc::new(Shared {
                ops: Mutex::new(ops),
                store: Box::new(store),
                stats,
            }),
        })
    }

    /// Appends a request under a fresh `op_id`.
    pub async fn enqueue(&self, request: OperationRequest) -> Result<OpId, DurabilityError> {
        self.enqueue_with_id(OpId::new(), request).await
    }

    /// Appends a request under an `op_id` chosen by the caller, e.g. one
    /// already used for a direct send whose outcome is unknown.
    pub async fn enqueue_with_id(
        &self,
        op_id: OpId,
        request: OperationRequest,
    ) -> Result<OpId, DurabilityError> {
        let op = QueuedOperation::new(op_id, request);
        let kind = op.kind();
        let mut ops = self.shared.ops.lock().await;
        let mut next = ops.clone();
        next.push(op);
        self.commit(&mut ops, next).await?;
        info!(%op_id, %kind, depth = ops.len(), "Operation enqueued");
        Ok(op_id)
    }

    /// Oldest operation that is not already in flight. A `FAILED` head is
    /// returned as is so the caller can see the queue is blocked.
    pub async fn peek_next(&self) -> Option<QueuedOperation> {
        self.shared
            .ops
            .lock()
            .await
            .iter()
            .find(|op| op.status != OpStatus::InFlight)
            .cloned()
    }

    /// Oldest operation whatever its status.
    pub async fn head(&self) -> Option<QueuedOperation> {
        self.shared.ops.lock().await.first().cloned()
    }

    pub async fn mark_in_flight(&self, op_id: OpId) -> Result<(), FloorError> {
        self.transition(op_id, "dispatched", |op| {
            if op.status != OpStatus::Pending {
                return false;
            }
            op.status = OpStatus::InFlight;
            true
        })
        .await
    }

    /// Returns an `IN_FLIGHT` operation whose outcome was never recorded to
    /// `PENDING`. Resending is safe since the server deduplicates on `op_id`.
    pub async fn release(&self, op_id: OpId) -> Result<(), FloorError> {
        self.transition(op_id, "released", |op| {
            if op.status != OpStatus::InFlight {
                return false;
            }
            op.status = OpStatus::Pending;
            true
        })
        .await?;
        warn!(%op_id, "Interrupted delivery returned to pending");
        Ok(())
    }

    /// The server acknowledged the operation; it leaves the queue.
    pub async fn mark_succeeded(&self, op_id: OpId) -> Result<(), FloorError> {
        self.remove_where(op_id, "acknowledged", |_| true).await?;
        info!(%op_id, "Operation acknowledged");
        Ok(())
    }

    /// Records a failed attempt. `Retry` leaves the operation `PENDING`,
    /// `Park` marks it `FAILED` until the operator acts on it.
    pub async fn mark_failed(
        &self,
        op_id: OpId,
        error: &str,
        disposition: FailureDisposition,
    ) -> Result<(), FloorError> {
        self.transition(op_id, "marked failed", |op| {
            if op.status == OpStatus::Failed {
                return false;
            }
            op.attempt_count += 1;
            op.last_error = Some(error.to_string());
            op.status = match disposition {
                FailureDisposition::Retry => OpStatus::Pending,
                FailureDisposition::Park => OpStatus::Failed,
            };
            true
        })
        .await?;
        match disposition {
            FailureDisposition::Retry => info!(%op_id, error, "Operation left pending for retry"),
            FailureDisposition::Park => warn!(%op_id, error, "Operation parked as failed"),
        }
        Ok(())
    }

    /// Withdraws an operation that has not been dispatched yet.
    pub async fn cancel(&self, op_id: OpId) -> Result<(), FloorError> {
        self.remove_where(op_id, "cancelled", |op| op.status == OpStatus::Pending)
            .await?;
        info!(%op_id, "Operation cancelled by operator");
        Ok(())
    }

    /// Drops a `FAILED` operation after the operator has reviewed it.
    pub async fn discard(&self, op_id: OpId) -> Result<(), FloorError> {
        self.remove_where(op_id, "discarded", |op| op.status == OpStatus::Failed)
            .await?;
        info!(%op_id, "Failed operation discarded by operator");
        Ok(())
    }

    /// Returns a `FAILED` operation to `PENDING` so the next flush tries it
    /// again. Its position in the queue is unchanged.
    pub async fn retry(&self, op_id: OpId) -> Result<(), FloorError> {
        self.transition(op_id, "retried", |op| {
            if op.status != OpStatus::Failed {
                return false;
            }
            op.status = OpStatus::Pending;
            true
        })
        .await?;
        info!(%op_id, "Failed operation re-armed by operator");
        Ok(())
    }

    pub async fn get(&self, op_id: OpId) -> Option<QueuedOperation> {
        self.shared
            .ops
            .lock()
            .await
            .iter()
            .find(|op| op.op_id == op_id)
            .cloned()
    }

    pub async fn snapshot(&self) -> Vec<QueuedOperation> {
        self.shared.ops.lock().await.clone()
    }

    /// Unacknowledged operations for one unit, in queue order.
    pub async fn pending_for(&self, wip_id: &str) -> Vec<QueuedOperation> {
        self.shared
            .ops
            .lock()
            .await
            .iter()
            .filter(|op| op.request.wip_id() == wip_id)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.shared.ops.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.shared.ops.lock().await.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        *self.shared.stats.borrow()
    }

    pub fn subscribe_stats(&self) -> watch::Receiver<QueueStats> {
        self.shared.stats.subscribe()
    }

    async fn transition(
        &self,
        op_id: OpId,
        action: &'static str,
        apply: impl FnOnce(&mut QueuedOperation) -> bool,
    ) -> Result<(), FloorError> {
        let mut ops = self.shared.ops.lock().await;
        let mut next = ops.clone();
        let op = next
            .iter_mut()
            .find(|op| op.op_id == op_id)
            .ok_or(FloorError::OperationNotFound(op_id))?;
        let status = op.status;
        if !apply(op) {
            return Err(FloorError::InvalidQueueState {
                op_id,
                status,
                action,
            });
        }
        self.commit(&mut ops, next).await?;
        Ok(())
    }

    async fn remove_where(
        &self,
        op_id: OpId,
        action: &'static str,
        allowed: impl FnOnce(&QueuedOperation) -> bool,
    ) -> Result<(), FloorError> {
        let mut ops = self.shared.ops.lock().await;
        let index = ops
            .iter()
            .position(|op| op.op_id == op_id)
            .ok_or(FloorError::OperationNotFound(op_id))?;
        if !allowed(&ops[index]) {
            return Err(FloorError::InvalidQueueState {
                op_id,
                status: ops[index].status,
                action,
            });
        }
        let mut next = ops.clone();
        next.remove(index);
        self.commit(&mut ops, next).await?;
        Ok(())
    }

    async fn commit(
        &self,
        current: &mut Vec<QueuedOperation>,
        next: Vec<QueuedOperation>,
    ) -> Result<(), DurabilityError> {
        self.shared.store.persist(&next).await?;
        *current = next;
        self.shared.stats.send_replace(QueueStats::of(current));
        Ok(())
    }
}
