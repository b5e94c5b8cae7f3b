//! HTTP client for the AI service.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::{AiService, Endpoint, RemoteResult};
use crate::error::{Result, TrackerError};
use crate::task::TaskKind;

#[derive(Deserialize)]
struct SubmitResponse {
    query_id: String,
}

/// `reqwest`-backed [`AiService`].
///
/// # Example
///
/// ```rust,ignore
/// use asktrack::remote::{AiService, AiServiceClient};
/// use asktrack::task::TaskKind;
///
/// let client = AiServiceClient::new("http://localhost:5555", Duration::from_secs(30))?;
/// let query_id = client.submit(TaskKind::Ask, &json!({"query": "top customers"})).await?;
/// let result = client.fetch(TaskKind::Ask, &query_id).await?;
/// ```
#[derive(Debug, Clone)]
pub struct AiServiceClient {
    client: Client,
    base_url: String,
}

impl AiServiceClient {
    /// Build a client for the service at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Map an HTTP failure status onto the error taxonomy.
///
/// 5xx, 408 and 429 are transient; every other 4xx is a rejection.
pub(crate) fn classify_status(query_id: &str, status: StatusCode, body: &str) -> TrackerError {
    let message = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body)
    };
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        TrackerError::transient(query_id, message)
    } else {
        TrackerError::RemoteRejected {
            query_id: query_id.to_string(),
            status: status.as_u16(),
            message,
        }
    }
}

#[async_trait]
impl AiService for AiServiceClient {
    async fn submit(&self, kind: TaskKind, payload: &Value) -> Result<String> {
        let endpoint = Endpoint::for_kind(kind);
        let submit_error = |message: String| TrackerError::Submit { kind, message };

        let response = self
            .client
            .post(self.url(endpoint.path))
            .json(payload)
            .send()
            .await
            .map_err(|e| submit_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(submit_error(format!("HTTP {}: {}", status, body)));
        }

        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|e| submit_error(format!("invalid submit response: {}", e)))?;
        debug!(kind = %kind, query_id = %body.query_id, "Submitted job");
        Ok(body.query_id)
    }

    async fn fetch(&self, kind: TaskKind, query_id: &str) -> Result<RemoteResult> {
        let endpoint = Endpoint::for_kind(kind);
        let response = self
            .client
            .get(self.url(&endpoint.result_path(query_id)))
            .send()
            .await
            .map_err(|e| TrackerError::transient(query_id, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(query_id, status, &body));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| TrackerError::transient(query_id, e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| TrackerError::MalformedResponse {
            query_id: query_id.to_string(),
            message: e.to_string(),
        })
    }

    async fn cancel(&self, kind: TaskKind, query_id: &str) -> Result<()> {
        let endpoint = Endpoint::for_kind(kind);
        let cancel_error = |message: String| TrackerError::Cancel {
            kind,
            query_id: query_id.to_string(),
            message,
        };
        if !endpoint.cancellable {
            return Err(cancel_error("kind does not support cancellation".to_string()));
        }

        let response = self
            .client
            .patch(self.url(&endpoint.job_path(query_id)))
            .json(&json!({ "status": "stopped" }))
            .send()
            .await
            .map_err(|e| cancel_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(cancel_error(format!("HTTP {}: {}", status, body)));
        }
        debug!(kind = %kind, query_id, "Requested job cancellation");
        Ok(())
    }
}
