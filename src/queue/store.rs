use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::operation::{OpId, OpStatus, OperationKind, OperationRequest, QueuedOperation};

/// Current on-disk schema. Bump it together with a new arm in [`migrate`].
pub const SCHEMA_VERSION: u32 = 1;

/// Local persistence of the queue failed. Losing an operator action silently
/// is not acceptable, so these always reach the caller.
#[derive(Debug, Error)]
pub enum DurabilityError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode queue: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("queue document is corrupt: {0}")]
    Corrupt(String),

    #[error("queue schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: u64, supported: u32 },

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Persisted form of one queued operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueRecord {
    op_id: OpId,
    kind: OperationKind,
    payload: Value,
    created_at: DateTime<Utc>,
    #[serde(default)]
    attempt_count: u32,
    status: OpStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
}

impl QueueRecord {
    fn from_operation(op: &QueuedOperation) -> Result<Self, DurabilityError> {
        let payload = match &op.request {
            OperationRequest::Start(req) => serde_json::to_value(req)?,
            OperationRequest::Complete(req) => serde_json::to_value(req)?,
        };
        Ok(Self {
            op_id: op.op_id,
            kind: op.kind(),
            payload,
            created_at: op.created_at,
            attempt_count: op.attempt_count,
            status: op.status,
            last_error: op.last_error.clone(),
        })
    }

    fn into_operation(self) -> Result<QueuedOperation, DurabilityError> {
        let corrupt = |e: serde_json::Error| {
            DurabilityError::Corrupt(format!("operation {}: {e}", self.op_id))
        };
        let request = match self.kind {
            OperationKind::Start => {
                OperationRequest::Start(serde_json::from_value(self.payload.clone()).map_err(corrupt)?)
            }
            OperationKind::Complete => OperationRequest::Complete(
                serde_json::from_value(self.payload.clone()).map_err(corrupt)?,
            ),
        };
        Ok(QueuedOperation {
            op_id: self.op_id,
            request,
            created_at: self.created_at,
            attempt_count: self.attempt_count,
            status: self.status,
            last_error: self.last_error,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct QueueDocument {
    schema_version: u32,
    operations: Vec<QueueRecord>,
}

pub fn encode_document(ops: &[QueuedOperation]) -> Result<String, DurabilityError> {
    let operations = ops
        .iter()
        .map(QueueRecord::from_operation)
        .collect::<Result<Vec<_>, _>>()?;
    let document = QueueDocument {
        schema_version: SCHEMA_VERSION,
        operations,
    };
    Ok(serde_json::to_string_pretty(&document)?)
}

pub fn decode_document(text: &str) -> Result<Vec<QueuedOperation>, DurabilityError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| DurabilityError::Corrupt(e.to_string()))?;
    migrate(value)?
        .operations
        .into_iter()
        .map(QueueRecord::into_operation)
        .collect()
}

/// Brings an older document up to [`SCHEMA_VERSION`]. Documents written by a
/// newer client are refused rather than rewritten, so nothing is dropped.
fn migrate(value: Value) -> Result<QueueDocument, DurabilityError> {
    let value = match value {
        // Schema 0: a bare array of records with no envelope.
        Value::Array(records) => {
            info!(
                records = records.len(),
                "Migrating unversioned queue document"
            );
            json!({ "schema_version": SCHEMA_VERSION, "operations": records })
        }
        other => other,
    };

    let version = value
        .get("schema_version")
        .and_then(Value::as_u64)
        .ok_or_else(|| DurabilityError::Corrupt("missing schema_version".into()))?;
    if version > u64::from(SCHEMA_VERSION) {
        return Err(DurabilityError::UnsupportedSchema {
            found: version,
            supported: SCHEMA_VERSION,
        });
    }

    serde_json::from_value(value).map_err(|e| DurabilityError::Corrupt(e.to_string()))
}

/// Durable backing for [`OperationQueue`](super::OperationQueue).
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Loads every persisted operation in queue order. A store that was never
    /// written returns an empty list.
    async fn load(&self) -> Result<Vec<QueuedOperation>, DurabilityError>;

    /// Replaces the persisted queue with `ops`. Returns only once the data is
    /// durable.
    async fn persist(&self, ops: &[QueuedOperation]) -> Result<(), DurabilityError>;
}

#[async_trait]
impl<T: QueueStore + ?Sized> QueueStore for Arc<T> {
    async fn load(&self) -> Result<Vec<QueuedOperation>, DurabilityError> {
        (**self).load().await
    }

    async fn persist(&self, ops: &[QueuedOperation]) -> Result<(), DurabilityError> {
        (**self).persist(ops).await
    }
}

/// Queue persisted as a JSON document on the local filesystem.
#[derive(Debug, Clone)]
pub struct FileQueueStore {
    path: PathBuf,
}

impl FileQueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl QueueStore for FileQueueStore {
    async fn load(&self) -> Result<Vec<QueuedOperation>, DurabilityError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(file = ?self.path, "No queue file yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        decode_document(&text)
    }

    async fn persist(&self, ops: &[QueuedOperation]) -> Result<(), DurabilityError> {
        let serialized = encode_document(ops)?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }

        // Write to a temporary file first, then rename over the original.
        let temp_path = PathBuf::from(format!("{}.tmp", self.path.display()));
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(serialized.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, &self.path).await?;

        debug!(file = ?self.path, operations = ops.len(), "Queue persisted");
        Ok(())
    }
}

/// Keeps the encoded document in memory. Clones share the same document, so
/// reopening a queue from a clone behaves like a process restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueueStore {
    document: Arc<Mutex<Option<String>>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The document as it would appear on disk.
    pub fn contents(&self) -> Option<String> {
        self.document.lock().ok().and_then(|doc| doc.clone())
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn load(&self) -> Result<Vec<QueuedOperation>, DurabilityError> {
        let document = self
            .document
            .lock()
            .map_err(|e| DurabilityError::Unavailable(e.to_string()))?
            .clone();
        match document {
            Some(text) => decode_document(&text),
            None => Ok(Vec::new()),
        }
    }

    async fn persist(&self, ops: &[QueuedOperation]) -> Result<(), DurabilityError> {
        let serialized = encode_document(ops)?;
        *self
            .document
            .lock()
            .map_err(|e| DurabilityError::Unavailable(e.to_string()))? = Some(serialized);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::ProcessResult;
    use crate::server::{CompleteRequest, Measurement, MeasurementValue, StartRequest};
    use tempfile::TempDir;

    fn start_op() -> QueuedOperation {
        QueuedOperation::new(
            OpId::new(),
            OperationRequest::Start(StartRequest {
                wip_id: "WIP-1".into(),
                process_id: "P3".into(),
                worker_id: "op-7".into(),
                equipment_id: None,
                line_id: Some("L1".into()),
            }),
        )
    }

    fn complete_op() -> QueuedOperation {
        QueuedOperation::new(
            OpId::new(),
            OperationRequest::Complete(CompleteRequest {
                wip_id: "WIP-1".into(),
                process_id: "P3".into(),
                worker_id: "op-7".into(),
                result: ProcessResult::Pass,
                measurements: vec![Measurement {
                    name: "gap".into(),
                    value: MeasurementValue::Numeric {
                        value: 0.25,
                        unit: Some("mm".into()),
                    },
                }],
                defect_data: Vec::new(),
            }),
        )
    }

    #[test]
    fn document_records_match_persisted_shape() {
        let op = start_op();
        let text = encode_document(std::slice::from_ref(&op)).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["schema_version"], SCHEMA_VERSION);
        let record = &value["operations"][0];
        assert_eq!(record["op_id"], op.op_id.to_string());
        assert_eq!(record["kind"], "START");
        assert_eq!(record["status"], "PENDING");
        assert_eq!(record["attempt_count"], 0);
        assert_eq!(record["payload"]["process_id"], "P3");
        assert!(record.get("last_error").is_none());
    }

    #[test]
    fn unversioned_array_is_migrated() {
        let op = complete_op();
        let text = encode_document(std::slice::from_ref(&op)).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        let legacy = serde_json::to_string(&value["operations"]).unwrap();

        let ops = decode_document(&legacy).unwrap();
        assert_eq!(ops, vec![op]);
    }

    #[test]
    fn missing_attempt_count_defaults_to_zero() {
        let op = start_op();
        let text = encode_document(std::slice::from_ref(&op)).unwrap();
        let mut value: Value = serde_json::from_str(&text).unwrap();
        value["operations"][0]
            .as_object_mut()
            .unwrap()
            .remove("attempt_count");
        let ops = decode_document(&value.to_string()).unwrap();
        assert_eq!(ops[0].attempt_count, 0);
    }

    #[test]
    fn newer_schema_is_refused() {
        let text = r#"{"schema_version": 99, "operations": []}"#;
        let err = decode_document(text).unwrap_err();
        assert!(matches!(
            err,
            DurabilityError::UnsupportedSchema { found: 99, .. }
        ));
    }

    #[test]
    fn garbage_is_reported_as_corrupt() {
        assert!(matches!(
            decode_document("{not json").unwrap_err(),
            DurabilityError::Corrupt(_)
        ));
        assert!(matches!(
            decode_document(r#"{"operations": []}"#).unwrap_err(),
            DurabilityError::Corrupt(_)
        ));
    }

    #[test]
    fn payload_not_matching_kind_is_corrupt() {
        let op = start_op();
        let text = encode_document(std::slice::from_ref(&op)).unwrap();
        let tampered = text.replace(r#""kind": "START""#, r#""kind": "COMPLETE""#);
        assert!(matches!(
            decode_document(&tampered).unwrap_err(),
            DurabilityError::Corrupt(_)
        ));
    }

    #[tokio::test]
    async fn file_store_missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileQueueStore::new(dir.path().join("queue.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_store_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("queue.json");
        let store = FileQueueStore::new(&path);
        let ops = vec![start_op(), complete_op()];

        store.persist(&ops).await.unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("nested").join("queue.json.tmp").exists());

        let reopened = FileQueueStore::new(&path);
        assert_eq!(reopened.load().await.unwrap(), ops);
    }

    #[tokio::test]
    async fn memory_store_clones_share_document() {
        let store = MemoryQueueStore::new();
        assert!(store.contents().is_none());
        let ops = vec![start_op()];
        store.persist(&ops).await.unwrap();

        let clone = store.clone();
        assert_eq!(clone.load().await.unwrap(), ops);
        assert!(clone.contents().unwrap().contains("schema_version"));
    }
}
