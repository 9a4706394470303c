use chrono::{DateTime, Utc};
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use warp::http::{HeaderValue, StatusCode};
use warp::{Filter, Rejection, Reply};
use tracing::error;
use crate::error::CoreError;
use crate::task_store::TaskStore;

pub mod sse;
pub mod statistics;
pub mod tasks;
pub mod workers;

pub fn routes(store: Arc<TaskStore>) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  tasks::task_routes(store.clone())
    .or(sse::sse_route(store.clone()))
    .or(workers::worker_routes(store.clone()))
    .or(statistics::statistics_routes(store))
}

pub(crate) fn with_store(store: Arc<TaskStore>) -> impl Filter<Extract = (Arc<TaskStore>,), Error = Infallible> + Clone {
  warp::any().map(move || store.clone())
}

/// Who the rate limiter charges: an explicit client id if sent, the peer address otherwise.
pub(crate) fn caller() -> impl Filter<Extract = (String,), Error = Rejection> + Clone {
  warp::header::optional::<String>("x-client-id")
    .and(warp::addr::remote())
    .map(|client_id: Option<String>, addr: Option<SocketAddr>| {
      client_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .or_else(|| addr.map(|a| a.ip().to_string()))
        .unwrap_or_else(|| "anonymous".to_string())
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
  timestamp: DateTime<Utc>,
  status: u16,
  message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  retry_after: Option<u64>,
}

fn status_for(e: &CoreError) -> StatusCode {
  match e {
    CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
    CoreError::Conflict { .. } => StatusCode::CONFLICT,
    CoreError::Validation(_) => StatusCode::BAD_REQUEST,
    CoreError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
    CoreError::TransientDelivery(_) => StatusCode::SERVICE_UNAVAILABLE,
    CoreError::Configuration(_) => StatusCode::UNPROCESSABLE_ENTITY,
    CoreError::Storage(_) | CoreError::Corrupt(_) => StatusCode::INTERNAL_SERVER_ERROR,
  }
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
  let (status, message, retry_after) = if let Some(e) = err.find::<CoreError>() {
    let status = status_for(e);
    let retry_after = match e {
      CoreError::RateLimitExceeded { retry_after } => Some(retry_after.as_millis().div_ceil(1000).max(1) as u64),
      _ => None,
    };
    let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
      error!("Internal error: {}", e);
      "Internal server error".to_string()
    } else {
      e.to_string()
    };
    (status, message, retry_after)
  } else if err.is_not_found() {
    (StatusCode::NOT_FOUND, "Not found".to_string(), None)
  } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
    (StatusCode::BAD_REQUEST, format!("Invalid request body: {}", e), None)
  } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
    (StatusCode::BAD_REQUEST, e.to_string(), None)
  } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string(), None)
  } else {
    error!("Unhandled rejection: {:?}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string(), None)
  };

  let body = ErrorBody { timestamp: Utc::now(), status: status.as_u16(), message, retry_after };
  let mut response = warp::reply::with_status(warp::reply::json(&body), status).into_response();
  if let Some(secs) = retry_after {
    response.headers_mut().insert("Retry-After", HeaderValue::from(secs));
  }
  Ok(response)
}

#[cfg(test)]
pub(crate) mod test_support {
  use std::sync::Arc;
  use std::time::Duration;
  use crate::clock::ManualClock;
  use crate::messaging::MemoryChannel;
  use crate::rate_limiter::{RateLimitPolicy, SlidingWindowLimiter};
  use crate::retry_scheduler::{BackoffPolicy, RetryScheduler};
  use crate::store::{MemoryTaskRepository, MemoryWorkerRepository};
  use crate::task_store::TaskStore;
  use crate::worker_registry::WorkerRegistry;

  pub fn store(limit: u32) -> Arc<TaskStore> {
    let clock = Arc::new(ManualClock::default());
    let workers = Arc::new(WorkerRegistry::new(
      Arc::new(MemoryWorkerRepository::new()),
      clock.clone(),
      Duration::from_secs(60),
    ));
    Arc::new(TaskStore::new(
      Arc::new(MemoryTaskRepository::new()),
      Arc::new(MemoryChannel::new()),
      workers,
      Arc::new(RetryScheduler::new(BackoffPolicy::default(), clock.clone())),
      Arc::new(SlidingWindowLimiter::new(RateLimitPolicy::per_minute(limit), clock.clone())),
      clock,
    ))
  }
}
