use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use super::model::{Process, ProcessHistoryEntry, ProcessResult, ProcessStatus, WipTrace};
use crate::queue::{OpStatus, OperationRequest, QueuedOperation};

/// Reasons a process catalog cannot drive a flow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("catalog has no processes")]
    Empty,

    #[error("process number {0} appears more than once")]
    Duplicate(u32),

    #[error("process numbers must be contiguous from 1: expected {expected}, found {found}")]
    Gap { expected: u32, found: u32 },
}

/// An operator action that violates the flow invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreconditionError {
    #[error("process {0} is not part of this route")]
    UnknownProcess(u32),

    #[error("process {open} is still in progress; complete it before starting process {requested}")]
    AnotherStepOpen { open: u32, requested: u32 },

    #[error("process {0} has already passed")]
    AlreadyPassed(u32),

    #[error("process {requested} is not in progress")]
    NotInProgress { requested: u32, open: Option<u32> },
}

/// Pure derivation layer over a unit's trace and the route's process catalog.
#[derive(Debug, Clone)]
pub struct ProcessFlowEngine {
    catalog: Vec<Process>,
}

impl ProcessFlowEngine {
    /// Validates that the catalog is numbered 1..=N without gaps or duplicates.
    pub fn new(mut catalog: Vec<Process>) -> Result<Self, CatalogError> {
        if catalog.is_empty() {
            return Err(CatalogError::Empty);
        }
        catalog.sort_by_key(|p| p.process_number);
        for (index, process) in catalog.iter().enumerate() {
            let expected = index as u32 + 1;
            if process.process_number == expected {
                continue;
            }
            if index > 0 && catalog[index - 1].process_number == process.process_number {
                return Err(CatalogError::Duplicate(process.process_number));
            }
            return Err(CatalogError::Gap {
                expected,
                found: process.process_number,
            });
        }
        Ok(Self { catalog })
    }

    pub fn catalog(&self) -> &[Process] {
        &self.catalog
    }

    pub fn process(&self, process_number: u32) -> Result<&Process, PreconditionError> {
        self.catalog
            .get((process_number as usize).wrapping_sub(1))
            .filter(|p| p.process_number == process_number)
            .ok_or(PreconditionError::UnknownProcess(process_number))
    }

    pub fn process_by_id(&self, process_id: &str) -> Option<&Process> {
        self.catalog.iter().find(|p| p.process_id == process_id)
    }

    /// Status of every catalog step after replaying the trace in
    /// chronological order. A later entry for the same step overwrites an
    /// earlier one, which is how rework re-attempts show up.
    pub fn compute_statuses(&self, trace: &WipTrace) -> BTreeMap<u32, ProcessStatus> {
        let mut statuses: BTreeMap<u32, ProcessStatus> = self
            .catalog
            .iter()
            .map(|p| (p.process_number, ProcessStatus::Pending))
            .collect();

        for entry in chronological(&trace.process_history) {
            let Some(slot) = statuses.get_mut(&entry.process_number) else {
                debug!(
                    wip_id = %trace.wip_id,
                    process_number = entry.process_number,
                    "Ignoring history entry outside the catalog"
                );
                continue;
            };
            if let Some(status) = entry_status(entry) {
                *slot = status;
            }
        }

        statuses
    }

    pub fn evaluate(&self, trace: &WipTrace) -> FlowSnapshot {
        let snapshot = FlowSnapshot {
            statuses: self.compute_statuses(trace),
        };
        let open = snapshot.open_steps();
        if open.len() > 1 {
            warn!(
                wip_id = %trace.wip_id,
                open_steps = ?open,
                "Trace has more than one open step"
            );
        }
        snapshot
    }

    pub fn next_actionable(&self, trace: &WipTrace) -> Option<u32> {
        self.evaluate(trace).next_actionable()
    }

    pub fn can_start(&self, trace: &WipTrace, process_number: u32) -> bool {
        self.evaluate(trace).can_start(process_number)
    }

    pub fn can_complete(&self, trace: &WipTrace, process_number: u32) -> bool {
        self.evaluate(trace).can_complete(process_number)
    }

    /// Overlays operations that the server has not acknowledged yet onto the
    /// trace, so decisions made offline see the operator's own queued work.
    /// Failed operations will not be applied and are left out.
    pub fn project(&self, trace: &WipTrace, queued: &[QueuedOperation]) -> WipTrace {
        let mut projected = trace.clone();
        let mut latest = projected
            .process_history
            .iter()
            .flat_map(|e| [e.start_time, e.complete_time])
            .flatten()
            .max();

        for op in queued {
            if op.status == OpStatus::Failed || op.request.wip_id() != trace.wip_id {
                continue;
            }
            let Some(process) = self.process_by_id(op.request.process_id()) else {
                warn!(
                    op_id = %op.op_id,
                    process_id = op.request.process_id(),
                    "Queued operation references a process outside the catalog"
                );
                continue;
            };
            // Keep projected entries after everything the server reported,
            // regardless of local clock skew.
            let at = latest.map_or(op.created_at, |t| t.max(op.created_at));
            latest = Some(at);

            let number = process.process_number;
            match &op.request {
                OperationRequest::Start(_) => {
                    projected.process_history.push(ProcessHistoryEntry {
                        process_number: number,
                        start_time: Some(at),
                        complete_time: None,
                        result: None,
                    });
                }
                OperationRequest::Complete(req) => {
                    let open = projected
                        .process_history
                        .iter_mut()
                        .rev()
                        .find(|e| e.process_number == number && e.is_open());
                    match open {
                        Some(entry) => {
                            entry.complete_time = Some(at);
                            entry.result = Some(req.result);
                        }
                        None => projected.process_history.push(ProcessHistoryEntry {
                            process_number: number,
                            start_time: None,
                            complete_time: Some(at),
                            result: Some(req.result),
                        }),
                    }
                }
            }
        }

        projected
    }
}

/// Entries ordered by start time (or completion time when never started).
/// Entries with no time at all keep their array position by inheriting the
/// time of the entry before them; the sort is stable.
fn chronological(history: &[ProcessHistoryEntry]) -> Vec<&ProcessHistoryEntry> {
    let mut carried: Option<DateTime<Utc>> = None;
    let mut keyed: Vec<(Option<DateTime<Utc>>, &ProcessHistoryEntry)> = history
        .iter()
        .map(|entry| {
            if let Some(t) = entry.effective_time() {
                carried = Some(t);
            }
            (carried, entry)
        })
        .collect();
    keyed.sort_by_key(|(key, _)| *key);
    keyed.into_iter().map(|(_, entry)| entry).collect()
}

fn entry_status(entry: &ProcessHistoryEntry) -> Option<ProcessStatus> {
    if entry.complete_time.is_some() {
        // A completion without a verdict never advances the flow.
        return Some(match entry.result {
            Some(ProcessResult::Pass) => ProcessStatus::Pass,
            Some(ProcessResult::Rework) => ProcessStatus::Rework,
            Some(ProcessResult::Fail) | None => ProcessStatus::Fail,
        });
    }
    entry.start_time.map(|_| ProcessStatus::InProgress)
}

/// Evaluated view of one unit's flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSnapshot {
    statuses: BTreeMap<u32, ProcessStatus>,
}

impl FlowSnapshot {
    pub fn statuses(&self) -> &BTreeMap<u32, ProcessStatus> {
        &self.statuses
    }

    pub fn status(&self, process_number: u32) -> Option<ProcessStatus> {
        self.statuses.get(&process_number).copied()
    }

    /// All steps currently open. More than one means the trace broke the
    /// one-open-step invariant.
    pub fn open_steps(&self) -> Vec<u32> {
        self.steps_with(ProcessStatus::InProgress)
    }

    pub fn in_progress(&self) -> Option<u32> {
        self.open_steps().first().copied()
    }

    pub fn has_anomaly(&self) -> bool {
        self.open_steps().len() > 1
    }

    /// Steps whose latest verdict is REWORK.
    pub fn rework_steps(&self) -> Vec<u32> {
        self.steps_with(ProcessStatus::Rework)
    }

    /// The open step if any, otherwise the lowest step that has not passed.
    /// `None` once every step has passed.
    pub fn next_actionable(&self) -> Option<u32> {
        self.in_progress().or_else(|| {
            self.statuses
                .iter()
                .find(|(_, status)| **status != ProcessStatus::Pass)
                .map(|(number, _)| *number)
        })
    }

    pub fn is_finished(&self) -> bool {
        self.statuses.values().all(|s| *s == ProcessStatus::Pass)
    }

    pub fn can_start(&self, process_number: u32) -> bool {
        self.ensure_can_start(process_number).is_ok()
    }

    pub fn can_complete(&self, process_number: u32) -> bool {
        self.ensure_can_complete(process_number).is_ok()
    }

    pub fn ensure_can_start(&self, process_number: u32) -> Result<(), PreconditionError> {
        let status = self
            .status(process_number)
            .ok_or(PreconditionError::UnknownProcess(process_number))?;
        if let Some(open) = self.in_progress() {
            return Err(PreconditionError::AnotherStepOpen {
                open,
                requested: process_number,
            });
        }
        if status == ProcessStatus::Pass {
            return Err(PreconditionError::AlreadyPassed(process_number));
        }
        Ok(())
    }

    pub fn ensure_can_complete(&self, process_number: u32) -> Result<(), PreconditionError> {
        if self.status(process_number).is_none() {
            return Err(PreconditionError::UnknownProcess(process_number));
        }
        let open = self.in_progress();
        if open == Some(process_number) {
            Ok(())
        } else {
            Err(PreconditionError::NotInProgress {
                requested: process_number,
                open,
            })
        }
    }

    fn steps_with(&self, wanted: ProcessStatus) -> Vec<u32> {
        self.statuses
            .iter()
            .filter(|(_, status)| **status == wanted)
            .map(|(number, _)| *number)
            .collect()
    }
}
