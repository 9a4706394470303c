use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::warn;
use uuid::Uuid;
use crate::error::{CoreError, Result};
use crate::models::Heartbeat;
use crate::worker_runtime::CoreClient;

const ATTEMPTS: usize = 3;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest<'a> {
  pub worker_id: &'a str,
}

#[derive(Serialize)]
pub struct CompleteRequest<'a> {
  pub result: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailRequest<'a> {
  pub error_message: &'a str,
  pub should_retry: bool,
}

/// Talks to the API over HTTP. Every call is bounded by the client timeout; transient
/// failures are retried a few times with jittered backoff.
#[derive(Clone)]
pub struct HttpCoreClient {
  http: Client,
  base_url: String,
}

impl HttpCoreClient {
  pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
    let http = Client::builder().timeout(timeout).build()?;
    Ok(Self { http, base_url: base_url.trim_end_matches('/').to_string() })
  }

  async fn post_once<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<()> {
    let url = format!("{}{}", self.base_url, path);
    let response = self
      .http
      .post(&url)
      .json(body)
      .send()
      .await
      .map_err(|e| CoreError::TransientDelivery(format!("POST {} failed: {}", url, e)))?;

    let status = response.status();
    if status.is_success() {
      return Ok(());
    }
    let message = response
      .json::<Value>()
      .await
      .ok()
      .and_then(|body| body.get("message").and_then(Value::as_str).map(str::to_string))
      .unwrap_or_else(|| status.to_string());
    Err(classify(status, path, message))
  }

  async fn post<B: Serialize + Sync + ?Sized>(&self, path: &str, body: &B) -> Result<()> {
    let strategy = ExponentialBackoff::from_millis(2).factor(100).map(jitter).take(ATTEMPTS);
    RetryIf::spawn(strategy, || self.post_once(path, body), |e: &CoreError| {
      let retry = e.is_transient();
      if retry {
        warn!("Retrying {}: {}", path, e);
      }
      retry
    })
      .await
  }
}

fn classify(status: StatusCode, path: &str, message: String) -> CoreError {
  match status {
    StatusCode::NOT_FOUND => CoreError::NotFound { kind: "Resource", id: path.to_string() },
    StatusCode::CONFLICT => CoreError::Conflict { id: path.to_string(), expected: "claimable".into(), actual: message },
    StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => CoreError::Validation(message),
    _ => CoreError::TransientDelivery(format!("{}: {}", status, message)),
  }
}

#[async_trait]
impl CoreClient for HttpCoreClient {
  async fn claim(&self, task_id: Uuid, worker_id: &str) -> Result<()> {
    self.post(&format!("/api/tasks/{}/processing", task_id), &ClaimRequest { worker_id }).await
  }

  async fn complete(&self, task_id: Uuid, result: &str) -> Result<()> {
    self.post(&format!("/api/tasks/{}/completed", task_id), &CompleteRequest { result }).await
  }

  async fn fail(&self, task_id: Uuid, error_message: &str, retryable: bool) -> Result<()> {
    let body = FailRequest { error_message, should_retry: retryable };
    self.post(&format!("/api/tasks/{}/failed", task_id), &body).await
  }

  async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<()> {
    self.post_once("/api/workers/heartbeat", heartbeat).await
  }
}
