mod engine;
mod model;

pub use engine::{CatalogError, FlowSnapshot, PreconditionError, ProcessFlowEngine};
pub use model::{
    DefectItem, LotInfo, Process, ProcessHistoryEntry, ProcessResult, ProcessStatus, WipTrace,
};
