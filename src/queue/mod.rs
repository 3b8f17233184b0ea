mod operation;
mod operation_queue;
mod store;

pub use operation::{
    FailureDisposition, OpId, OpStatus, OperationKind, OperationRequest, QueuedOperation,
};
pub use operation_queue::{OperationQueue, QueueStats};
pub use store::{
    DurabilityError, FileQueueStore, MemoryQueueStore, QueueStore, SCHEMA_VERSION,
    decode_document, encode_document,
};
