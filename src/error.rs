use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
  #[error("{kind} not found: {id}")]
  NotFound { kind: &'static str, id: String },

  #[error("Task {id} is {actual}, expected {expected}")]
  Conflict { id: String, expected: String, actual: String },

  #[error("Validation failed: {0}")]
  Validation(String),

  #[error("Rate limit exceeded, retry after {}ms", retry_after.as_millis())]
  RateLimitExceeded { retry_after: Duration },

  #[error("Delivery failed: {0}")]
  TransientDelivery(String),

  #[error("Configuration error: {0}")]
  Configuration(String),

  #[error("Storage error: {0}")]
  Storage(#[from] sqlx::Error),

  #[error("Corrupt record: {0}")]
  Corrupt(String),
}

impl CoreError {
  pub fn task_not_found(id: impl ToString) -> Self {
    CoreError::NotFound { kind: "Task", id: id.to_string() }
  }

  pub fn worker_not_found(id: impl ToString) -> Self {
    CoreError::NotFound { kind: "Worker", id: id.to_string() }
  }

  /// Whether the caller may repeat the same request unchanged and expect a different answer.
  pub fn is_transient(&self) -> bool {
    matches!(self, CoreError::TransientDelivery(_) | CoreError::RateLimitExceeded { .. } | CoreError::Storage(_))
  }
}

impl warp::reject::Reject for CoreError {}

pub type Result<T> = std::result::Result<T, CoreError>;
