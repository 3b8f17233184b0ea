#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use floorsync::flow::{Process, ProcessHistoryEntry, ProcessResult, WipTrace};
use floorsync::queue::{
    DurabilityError, MemoryQueueStore, OpId, OperationKind, OperationQueue, QueueStore,
    QueuedOperation,
};
use floorsync::server::{Ack, ApiError, CompleteRequest, ServerApi, StartRequest};
use floorsync::sync::{RetryPolicy, SyncCoordinator};

pub const WIP: &str = "WIP-1";

pub fn catalog(n: u32) -> Vec<Process> {
    (1..=n)
        .map(|i| Process {
            process_number: i,
            process_id: format!("P{i}"),
            name: format!("Step {i}"),
            defect_items: Vec::new(),
        })
        .collect()
}

pub fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(100),
        request_timeout: Duration::from_secs(1),
    }
}

/// One request as seen by the fake server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op_id: OpId,
    pub kind: OperationKind,
    pub process_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Healthy,
    /// Every mutating call fails with a network error.
    Partitioned,
    /// Every mutating call is refused with 409.
    Rejecting,
}

#[derive(Default)]
struct State {
    traces: HashMap<String, WipTrace>,
    applied: HashSet<OpId>,
    calls: Vec<Call>,
    transient_failures: u32,
    stall_once: bool,
    call_delay: Option<Duration>,
}

/// In-process server of record. Applies starts and completes to per-unit
/// traces and deduplicates on `op_id`.
pub struct FakeServer {
    state: Mutex<State>,
    mode: Mutex<Mode>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            mode: Mutex::new(Mode::Healthy),
        })
    }

    /// Seeds a unit whose first `passed` steps already passed.
    pub fn seed(&self, wip_id: &str, passed: u32) {
        let now = Utc::now();
        let history = (1..=passed)
            .map(|n| ProcessHistoryEntry {
                process_number: n,
                start_time: Some(now - chrono::Duration::minutes(10 * i64::from(passed - n + 1))),
                complete_time: Some(now - chrono::Duration::minutes(10 * i64::from(passed - n + 1) - 5)),
                result: Some(ProcessResult::Pass),
            })
            .collect();
        let trace = WipTrace {
            process_history: history,
            ..WipTrace::empty(wip_id)
        };
        self.state.lock().unwrap().traces.insert(wip_id.to_string(), trace);
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// The next `n` mutating calls fail with a network error.
    pub fn fail_next(&self, n: u32) {
        self.state.lock().unwrap().transient_failures = n;
    }

    /// The next mutating call is applied but its response never arrives.
    pub fn stall_once(&self) {
        self.state.lock().unwrap().stall_once = true;
    }

    pub fn delay_calls(&self, delay: Duration) {
        self.state.lock().unwrap().call_delay = Some(delay);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn trace(&self, wip_id: &str) -> WipTrace {
        self.state
            .lock()
            .unwrap()
            .traces
            .get(wip_id)
            .cloned()
            .unwrap_or_else(|| WipTrace::empty(wip_id))
    }

    async fn mutate(
        &self,
        call: Call,
        wip_id: &str,
        apply: impl FnOnce(&mut WipTrace) -> Result<(), String>,
    ) -> Result<Ack, ApiError> {
        let (delay, stall) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(call.clone());
            (state.call_delay, std::mem::take(&mut state.stall_once))
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mode = *self.mode.lock().unwrap();
        let outcome = {
            let mut state = self.state.lock().unwrap();
            if mode == Mode::Partitioned {
                return Err(ApiError::Network("connection refused".into()));
            }
            if state.transient_failures > 0 {
                state.transient_failures -= 1;
                return Err(ApiError::Network("connection reset".into()));
            }
            if mode == Mode::Rejecting {
                return Err(ApiError::Rejected {
                    status: 409,
                    message: "business rule conflict".into(),
                });
            }
            if state.applied.contains(&call.op_id) {
                Ok(Ack {
                    op_id: Some(call.op_id),
                    duplicate: true,
                })
            } else {
                let trace = state
                    .traces
                    .entry(wip_id.to_string())
                    .or_insert_with(|| WipTrace::empty(wip_id));
                match apply(trace) {
                    Ok(()) => {
                        state.applied.insert(call.op_id);
                        Ok(Ack {
                            op_id: Some(call.op_id),
                            duplicate: false,
                        })
                    }
                    Err(message) => Err(ApiError::Rejected {
                        status: 409,
                        message,
                    }),
                }
            }
        };

        if stall {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        outcome
    }
}

fn number_of(process_id: &str) -> u32 {
    process_id.trim_start_matches('P').parse().unwrap()
}

#[async_trait]
impl ServerApi for FakeServer {
    async fn fetch_trace(&self, wip_id: &str) -> Result<WipTrace, ApiError> {
        if *self.mode.lock().unwrap() == Mode::Partitioned {
            return Err(ApiError::Network("connection refused".into()));
        }
        Ok(self.trace(wip_id))
    }

    async fn start(&self, op_id: OpId, req: &StartRequest) -> Result<Ack, ApiError> {
        let call = Call {
            op_id,
            kind: OperationKind::Start,
            process_id: req.process_id.clone(),
        };
        let number = number_of(&req.process_id);
        self.mutate(call, &req.wip_id, |trace| {
            if trace.process_history.iter().any(|e| e.is_open()) {
                return Err("another process is open".into());
            }
            trace.process_history.push(ProcessHistoryEntry {
                process_number: number,
                start_time: Some(Utc::now()),
                complete_time: None,
                result: None,
            });
            Ok(())
        })
        .await
    }

    async fn complete(&self, op_id: OpId, req: &CompleteRequest) -> Result<Ack, ApiError> {
        let call = Call {
            op_id,
            kind: OperationKind::Complete,
            process_id: req.process_id.clone(),
        };
        let number = number_of(&req.process_id);
        let result = req.result;
        self.mutate(call, &req.wip_id, |trace| {
            let open = trace
                .process_history
                .iter_mut()
                .find(|e| e.process_number == number && e.is_open())
                .ok_or_else(|| format!("process {number} is not in progress"))?;
            open.complete_time = Some(Utc::now());
            open.result = Some(result);
            Ok(())
        })
        .await
    }
}

pub async fn coordinator(
    server: &Arc<FakeServer>,
    policy: RetryPolicy,
) -> (Arc<SyncCoordinator<FakeServer>>, OperationQueue, MemoryQueueStore) {
    let store = MemoryQueueStore::new();
    let queue = OperationQueue::open(store.clone()).await.unwrap();
    let coordinator = Arc::new(SyncCoordinator::new(
        Arc::clone(server),
        queue.clone(),
        policy,
    ));
    (coordinator, queue, store)
}

/// Store whose writes fail from the `fail_from`-th one (1-based) until
/// `heal` is called.
pub struct FailingStore {
    inner: MemoryQueueStore,
    writes: AtomicUsize,
    fail_from: AtomicUsize,
}

impl FailingStore {
    pub fn failing_from(nth_write: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryQueueStore::new(),
            writes: AtomicUsize::new(0),
            fail_from: AtomicUsize::new(nth_write),
        })
    }

    pub fn heal(&self) {
        self.fail_from.store(usize::MAX, Ordering::SeqCst);
    }
}

#[async_trait]
impl QueueStore for FailingStore {
    async fn load(&self) -> Result<Vec<QueuedOperation>, DurabilityError> {
        self.inner.load().await
    }

    async fn persist(&self, ops: &[QueuedOperation]) -> Result<(), DurabilityError> {
        let nth = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if nth >= self.fail_from.load(Ordering::SeqCst) {
            return Err(DurabilityError::Unavailable("disk busy".into()));
        }
        self.inner.persist(ops).await
    }
}
