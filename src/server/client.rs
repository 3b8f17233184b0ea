use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde::Serialize;
use tracing::debug;

use super::error::ApiError;
use super::types::{Ack, CompleteRequest, Envelope, StartRequest};
use crate::flow::WipTrace;
use crate::queue::{OpId, OperationRequest};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Server-of-record operations the core depends on.
///
/// Every mutating call carries the `op_id` of the logical request; the server
/// deduplicates on it so a retry after an ambiguous timeout applies at most
/// once.
#[async_trait]
pub trait ServerApi: Send + Sync {
    async fn fetch_trace(&self, wip_id: &str) -> Result<WipTrace, ApiError>;

    async fn start(&self, op_id: OpId, req: &StartRequest) -> Result<Ack, ApiError>;

    async fn complete(&self, op_id: OpId, req: &CompleteRequest) -> Result<Ack, ApiError>;

    /// Routes a queued request to the matching endpoint.
    async fn submit(&self, op_id: OpId, request: &OperationRequest) -> Result<Ack, ApiError> {
        match request {
            OperationRequest::Start(req) => self.start(op_id, req).await,
            OperationRequest::Complete(req) => self.complete(op_id, req).await,
        }
    }
}

/// `ServerApi` over HTTP/JSON.
pub struct HttpServerClient {
    client: Client,
    base_url: String,
}

impl HttpServerClient {
    pub fn new(
        base_url: impl Into<String>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Wraps an existing `reqwest::Client` (shared pools, custom TLS).
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Joins path segments onto the base URL, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url =
            Url::parse(&self.base_url).map_err(|e| ApiError::InvalidUrl(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn post<T: Serialize + Sync>(
        &self,
        segments: &[&str],
        op_id: OpId,
        body: &T,
    ) -> Result<Ack, ApiError> {
        let url = self.endpoint(segments)?;
        debug!(%url, %op_id, "Posting operation");
        let response = self
            .client
            .post(url)
            .header(IDEMPOTENCY_HEADER, op_id.to_string())
            .json(&Envelope { op_id, body })
            .send()
            .await?;

        let response = check_status(response).await?;
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Ack::default());
        }
        serde_json::from_str(&text).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ServerApi for HttpServerClient {
    async fn fetch_trace(&self, wip_id: &str) -> Result<WipTrace, ApiError> {
        let url = self.endpoint(&["wips", wip_id, "trace"])?;
        let response = self.client.get(url).send().await?;
        let response = check_status(response).await?;
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn start(&self, op_id: OpId, req: &StartRequest) -> Result<Ack, ApiError> {
        self.post(&["process", "start"], op_id, req).await
    }

    async fn complete(&self, op_id: OpId, req: &CompleteRequest) -> Result<Ack, ApiError> {
        self.post(&["process", "complete"], op_id, req).await
    }
}

async fn check_status(response: Response) -> Result<Response, ApiError> {
    let status = response.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|secs| secs.saturating_mul(1000))
            .unwrap_or(1000);
        return Err(ApiError::RateLimited {
            retry_after_ms: retry_after,
        });
    }

    if !status.is_success() {
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        return Err(ApiError::from_status(status.as_u16(), message));
    }

    Ok(response)
}
