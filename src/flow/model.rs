use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A defect category an operator may record against a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefectItem {
    pub code: String,
    pub name: String,
}

/// One step of a product's production route, as defined by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    /// Ordinal position in the route, 1..=N.
    pub process_number: u32,
    pub process_id: String,
    pub name: String,
    #[serde(default)]
    pub defect_items: Vec<DefectItem>,
}

/// Outcome recorded by the server when a process execution completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessResult {
    Pass,
    Fail,
    Rework,
}

impl fmt::Display for ProcessResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessResult::Pass => write!(f, "PASS"),
            ProcessResult::Fail => write!(f, "FAIL"),
            ProcessResult::Rework => write!(f, "REWORK"),
        }
    }
}

/// A single execution of a process on a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHistoryEntry {
    pub process_number: u32,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub complete_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<ProcessResult>,
}

impl ProcessHistoryEntry {
    /// Started and not yet completed.
    pub fn is_open(&self) -> bool {
        self.start_time.is_some() && self.complete_time.is_none()
    }

    pub(crate) fn effective_time(&self) -> Option<DateTime<Utc>> {
        self.start_time.or(self.complete_time)
    }
}

/// Batch information attached to a unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotInfo {
    #[serde(default)]
    pub lot_id: String,
    #[serde(default)]
    pub product_model: Option<String>,
    #[serde(default)]
    pub quantity: Option<u32>,
}

/// Ordered process history of one work-in-progress unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WipTrace {
    pub wip_id: String,
    #[serde(default)]
    pub lot_info: LotInfo,
    #[serde(default)]
    pub process_history: Vec<ProcessHistoryEntry>,
}

impl WipTrace {
    pub fn empty(wip_id: impl Into<String>) -> Self {
        Self {
            wip_id: wip_id.into(),
            lot_info: LotInfo::default(),
            process_history: Vec::new(),
        }
    }
}

/// Derived status of a step. Never persisted.
///
/// `Rework` is kept apart from `Fail` on purpose: whether a rework verdict is
/// ever terminal is an open business question, so it is reported as its own
/// non-terminal status and callers decide how to present it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    Pending,
    InProgress,
    Pass,
    Fail,
    Rework,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::Pending => write!(f, "PENDING"),
            ProcessStatus::InProgress => write!(f, "IN_PROGRESS"),
            ProcessStatus::Pass => write!(f, "PASS"),
            ProcessStatus::Fail => write!(f, "FAIL"),
            ProcessStatus::Rework => write!(f, "REWORK"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_deserializes_from_server_format() {
        let json = r#"{
            "wip_id": "WIP-0001",
            "lot_info": {"lot_id": "LOT-7", "product_model": "PX-200"},
            "process_history": [
                {"process_number": 1, "start_time": "2026-03-01T08:00:00Z",
                 "complete_time": "2026-03-01T08:10:00Z", "result": "PASS"},
                {"process_number": 2, "start_time": "2026-03-01T08:15:00Z"}
            ]
        }"#;
        let trace: WipTrace = serde_json::from_str(json).unwrap();
        assert_eq!(trace.wip_id, "WIP-0001");
        assert_eq!(trace.lot_info.lot_id, "LOT-7");
        assert_eq!(trace.lot_info.quantity, None);
        assert_eq!(trace.process_history.len(), 2);
        assert_eq!(trace.process_history[0].result, Some(ProcessResult::Pass));
        assert!(trace.process_history[1].is_open());
        assert!(!trace.process_history[0].is_open());
    }

    #[test]
    fn trace_tolerates_missing_lot_and_history() {
        let trace: WipTrace = serde_json::from_str(r#"{"wip_id": "W"}"#).unwrap();
        assert!(trace.process_history.is_empty());
        assert_eq!(trace.lot_info, LotInfo::default());
    }

    #[test]
    fn result_uses_upper_case_wire_names() {
        assert_eq!(
            serde_json::to_string(&ProcessResult::Rework).unwrap(),
            r#""REWORK""#
        );
        let parsed: ProcessResult = serde_json::from_str(r#""FAIL""#).unwrap();
        assert_eq!(parsed, ProcessResult::Fail);
    }

    #[test]
    fn status_display() {
        assert_eq!(ProcessStatus::Pending.to_string(), "PENDING");
        assert_eq!(ProcessStatus::InProgress.to_string(), "IN_PROGRESS");
        assert_eq!(ProcessStatus::Pass.to_string(), "PASS");
        assert_eq!(ProcessStatus::Fail.to_string(), "FAIL");
        assert_eq!(ProcessStatus::Rework.to_string(), "REWORK");
    }
}
