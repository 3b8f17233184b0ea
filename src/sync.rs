use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::error::FloorError;
use crate::flow::WipTrace;
use crate::network::{Connectivity, NetworkMonitor};
use crate::queue::{FailureDisposition, OpId, OpStatus, OperationQueue, QueueStats, QueuedOperation};
use crate::server::{Ack, ApiError, ServerApi};

/// Retry behaviour for a single queued operation within one flush.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per operation before it is parked as failed.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on one network attempt; elapsing counts as transient.
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            request_timeout: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt using exponential backoff.
    /// delay = min(base_delay * 2^(attempt - 1), max_delay)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Backoff for `attempt`, raised to the server's Retry-After hint. The
    /// hint is capped at `max_delay`.
    fn delay_after(&self, attempt: u32, err: &ApiError) -> Duration {
        let backoff = self.delay_for_attempt(attempt);
        match err.retry_after_ms() {
            Some(ms) => backoff.max(Duration::from_millis(ms).min(self.max_delay)),
            None => backoff,
        }
    }
}

/// Why a flush stopped before the queue was empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    /// The server definitively refused the operation.
    Rejected(String),
    /// Transient failures persisted through every allowed attempt.
    RetriesExhausted(String),
    /// The head of the queue is a failed operation waiting for the operator.
    AwaitingOperator,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    Drained {
        delivered: usize,
    },
    Halted {
        op_id: OpId,
        delivered: usize,
        reason: HaltReason,
    },
    /// Another flush was already running; this call did nothing.
    AlreadyRunning,
}

/// What the coordinator itself is doing, apart from queue counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncActivity {
    pub flushing: bool,
    pub in_flight: Option<OpId>,
    pub last_error: Option<String>,
}

/// Everything a sync indicator needs to render.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
    pub queue_depth: usize,
    pub failed: usize,
    pub flushing: bool,
    pub in_flight: Option<OpId>,
    pub last_error: Option<String>,
}

/// Receiver half of the coordinator's status stream.
pub struct SyncStatusStream {
    queue: watch::Receiver<QueueStats>,
    activity: watch::Receiver<SyncActivity>,
}

impl SyncStatusStream {
    pub fn current(&self) -> SyncStatus {
        let stats = *self.queue.borrow();
        let activity = self.activity.borrow().clone();
        SyncStatus {
            queue_depth: stats.depth,
            failed: stats.failed,
            flushing: activity.flushing,
            in_flight: activity.in_flight,
            last_error: activity.last_error,
        }
    }

    /// Waits for the next change to queue counts or coordinator activity.
    /// Returns `None` once the queue and coordinator are gone.
    pub async fn changed(&mut self) -> Option<SyncStatus> {
        let result = tokio::select! {
            r = self.queue.changed() => r,
            r = self.activity.changed() => r,
        };
        result.ok().map(|_| self.current())
    }
}

const TRACE_CAPACITY: usize = 32;

/// Drains the operation queue against the server, one operation at a time.
pub struct SyncCoordinator<A> {
    api: Arc<A>,
    queue: OperationQueue,
    policy: RetryPolicy,
    flush_lock: Mutex<()>,
    activity: watch::Sender<SyncActivity>,
    traces: broadcast::Sender<WipTrace>,
}

impl<A: ServerApi + 'static> SyncCoordinator<A> {
    pub fn new(api: Arc<A>, queue: OperationQueue, policy: RetryPolicy) -> Self {
        let (activity, _) = watch::channel(SyncActivity::default());
        let (traces, _) = broadcast::channel(TRACE_CAPACITY);
        Self {
            api,
            queue,
            policy,
            flush_lock: Mutex::new(()),
            activity,
            traces,
        }
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn status_stream(&self) -> SyncStatusStream {
        SyncStatusStream {
            queue: self.queue.subscribe_stats(),
            activity: self.activity.subscribe(),
        }
    }

    /// Fresh traces fetched after each acknowledged operation.
    pub fn trace_updates(&self) -> broadcast::Receiver<WipTrace> {
        self.traces.subscribe()
    }

    /// Drains the queue oldest-first. A call made while another flush is
    /// running returns `AlreadyRunning` immediately.
    ///
    /// Stops at the first operation that is rejected, exhausts its retries,
    /// or is already parked as failed; later operations are left untouched
    /// because they may depend on it.
    pub async fn flush(&self) -> Result<FlushOutcome, FloorError> {
        let Ok(_guard) = self.flush_lock.try_lock() else {
            info!("Flush already running");
            return Ok(FlushOutcome::AlreadyRunning);
        };

        self.activity.send_modify(|a| a.flushing = true);
        let result = self.drain().await;
        self.activity.send_modify(|a| {
            a.flushing = false;
            a.in_flight = None;
            if let Err(e) = &result {
                a.last_error = Some(e.to_string());
            }
        });

        match &result {
            Ok(outcome) => info!(?outcome, "Flush finished"),
            Err(e) => error!(error = %e, "Flush aborted"),
        }
        result
    }

    /// Runs `flush` on a background task.
    pub fn spawn_flush(self: &Arc<Self>) -> JoinHandle<Result<FlushOutcome, FloorError>> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.flush().await })
    }

    /// Flushes on every OFFLINE → ONLINE transition, and once right away if
    /// the monitor already reports online.
    pub fn watch_connectivity(self: &Arc<Self>, monitor: &NetworkMonitor) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut events = monitor.subscribe();
        let online_now = monitor.is_online();
        tokio::spawn(async move {
            if online_now {
                this.flush_logged().await;
            }
            loop {
                match events.recv().await {
                    Ok(Connectivity::Online) => this.flush_logged().await,
                    Ok(Connectivity::Offline) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed connectivity events; flushing to catch up");
                        this.flush_logged().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn flush_logged(&self) {
        match self.flush().await {
            Ok(outcome) => debug!(?outcome, "Reconnect flush done"),
            Err(e) => debug!(error = %e, "Reconnect flush failed"),
        }
    }

    async fn drain(&self) -> Result<FlushOutcome, FloorError> {
        let mut delivered = 0;
        let mut attempts: Option<(OpId, u32)> = None;

        loop {
            let Some(mut op) = self.queue.head().await else {
                return Ok(FlushOutcome::Drained { delivered });
            };
            if op.status == OpStatus::InFlight {
                // Flushes never overlap, so this is left over from one that
                // failed to record an outcome. It must go before anything behind it.
                self.queue.release(op.op_id).await?;
                op.status = OpStatus::Pending;
            }
            if op.status == OpStatus::Failed {
                warn!(op_id = %op.op_id, "Queue blocked by failed operation");
                return Ok(FlushOutcome::Halted {
                    op_id: op.op_id,
                    delivered,
                    reason: HaltReason::AwaitingOperator,
                });
            }

            let attempt = match attempts {
                Some((id, n)) if id == op.op_id => n + 1,
                _ => 1,
            };
            attempts = Some((op.op_id, attempt));

            self.queue.mark_in_flight(op.op_id).await?;
            self.activity.send_modify(|a| a.in_flight = Some(op.op_id));
            info!(op_id = %op.op_id, kind = %op.kind(), attempt, "Dispatching operation");

            let outcome = self.dispatch(&op).await;
            self.activity.send_modify(|a| a.in_flight = None);

            match outcome {
                Ok(ack) => {
                    self.queue.mark_succeeded(op.op_id).await?;
                    delivered += 1;
                    if ack.duplicate {
                        info!(op_id = %op.op_id, "Server had already applied operation");
                    }
                    self.activity.send_modify(|a| a.last_error = None);
                    self.refresh_trace(op.request.wip_id()).await;
                }
                Err(err) => {
                    let message = err.to_string();
                    self.activity
                        .send_modify(|a| a.last_error = Some(message.clone()));

                    if err.is_transient() && attempt < self.policy.max_attempts {
                        self.queue
                            .mark_failed(op.op_id, &message, FailureDisposition::Retry)
                            .await?;
                        let delay = self.policy.delay_after(attempt, &err);
                        warn!(
                            op_id = %op.op_id,
                            attempt,
                            max_attempts = self.policy.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Transient failure, backing off"
                        );
                        sleep(delay).await;
                        continue;
                    }

                    self.queue
                        .mark_failed(op.op_id, &message, FailureDisposition::Park)
                        .await?;
                    let reason = if err.is_transient() {
                        HaltReason::RetriesExhausted(message)
                    } else {
                        HaltReason::Rejected(message)
                    };
                    return Ok(FlushOutcome::Halted {
                        op_id: op.op_id,
                        delivered,
                        reason,
                    });
                }
            }
        }
    }

    async fn dispatch(&self, op: &QueuedOperation) -> Result<Ack, ApiError> {
        match timeout(
            self.policy.request_timeout,
            self.api.submit(op.op_id, &op.request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ApiError::Timeout),
        }
    }

    async fn refresh_trace(&self, wip_id: &str) {
        match timeout(self.policy.request_timeout, self.api.fetch_trace(wip_id)).await {
            Ok(Ok(trace)) => {
                let _ = self.traces.send(trace);
            }
            Ok(Err(e)) => warn!(wip_id, error = %e, "Trace refresh failed"),
            Err(_) => warn!(wip_id, "Trace refresh timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_exponential_backoff() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            request_timeout: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(10));
    }

    #[test]
    fn retry_after_is_a_lower_bound() {
        let policy = RetryPolicy::default();
        let limited = ApiError::RateLimited {
            retry_after_ms: 30_000,
        };
        assert_eq!(policy.delay_after(1, &limited), Duration::from_secs(30));
        let short = ApiError::RateLimited { retry_after_ms: 10 };
        assert_eq!(policy.delay_after(1, &short), Duration::from_secs(2));
    }

    #[test]
    fn retry_after_is_capped_at_max_delay() {
        let policy = RetryPolicy::default();
        let hostile = ApiError::RateLimited {
            retry_after_ms: u64::MAX,
        };
        assert_eq!(policy.delay_after(1, &hostile), policy.max_delay);
    }

    #[test]
    fn default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(2));
    }
}
