pub mod client;
pub mod error;
pub mod types;

pub use client::{HttpServerClient, ServerApi};
pub use error::ApiError;
pub use types::{Ack, CompleteRequest, DefectRecord, Measurement, MeasurementValue, StartRequest};
