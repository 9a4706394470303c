use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::info;
use crate::error::CoreError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcessingError {
  /// Worth another attempt (network blip, busy downstream).
  #[error("{0}")]
  Retryable(String),
  /// Will fail the same way every time (bad payload).
  #[error("{0}")]
  Fatal(String),
}

impl ProcessingError {
  pub fn is_retryable(&self) -> bool {
    matches!(self, ProcessingError::Retryable(_))
  }
}

pub type ProcessingResult = Result<String, ProcessingError>;

/// One kind of work. Consumes the payload, produces a JSON result or a classified error.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
  fn task_type(&self) -> &'static str;

  async fn execute(&self, payload: &str) -> ProcessingResult;
}

#[derive(Default, Clone)]
pub struct ProcessorRegistry {
  processors: HashMap<String, Arc<dyn TaskProcessor>>,
}

impl ProcessorRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// The processors this worker ships with, each simulating `work` of processing time.
  pub fn with_builtin(work: Duration) -> Self {
    let mut registry = Self::new();
    registry.register(EmailProcessor { work });
    registry.register(ImageProcessor { work });
    registry.register(DataAnalysisProcessor { work });
    registry
  }

  pub fn register<P: TaskProcessor + 'static>(&mut self, processor: P) {
    self.processors.insert(processor.task_type().to_string(), Arc::new(processor));
  }

  /// An unknown type is a deployment problem, not a transient fault.
  pub fn get(&self, task_type: &str) -> Result<Arc<dyn TaskProcessor>, CoreError> {
    self
      .processors
      .get(task_type)
      .cloned()
      .ok_or_else(|| CoreError::Configuration(format!("No processor found for task type: {}", task_type)))
  }

  pub fn task_types(&self) -> Vec<&str> {
    let mut types: Vec<&str> = self.processors.keys().map(String::as_str).collect();
    types.sort();
    types
  }
}

fn parse(payload: &str) -> Result<Value, ProcessingError> {
  serde_json::from_str(payload).map_err(|e| ProcessingError::Fatal(format!("Invalid payload: {}", e)))
}

fn required_str<'a>(payload: &'a Value, field: &str) -> Result<&'a str, ProcessingError> {
  payload
    .get(field)
    .and_then(Value::as_str)
    .filter(|s| !s.trim().is_empty())
    .ok_or_else(|| ProcessingError::Fatal(format!("Missing field '{}'", field)))
}

fn required_positive(payload: &Value, field: &str) -> Result<u64, ProcessingError> {
  payload
    .get(field)
    .and_then(Value::as_u64)
    .filter(|n| *n > 0)
    .ok_or_else(|| ProcessingError::Fatal(format!("Field '{}' must be a positive integer", field)))
}

pub struct EmailProcessor {
  pub work: Duration,
}

#[async_trait]
impl TaskProcessor for EmailProcessor {
  fn task_type(&self) -> &'static str {
    "EMAIL_SENDING"
  }

  async fn execute(&self, payload: &str) -> ProcessingResult {
    let payload = parse(payload)?;
    let recipient = required_str(&payload, "recipient")?;
    let subject = required_str(&payload, "subject")?;
    if !recipient.contains('@') {
      return Err(ProcessingError::Fatal(format!("Invalid recipient '{}'", recipient)));
    }
    info!("Sending email to {}", recipient);
    sleep(self.work).await;
    Ok(json!({
      "recipient": recipient,
      "subject": subject,
      "sent": true,
      "messageId": format!("msg-{}", uuid::Uuid::new_v4()),
    }).to_string())
  }
}

pub struct ImageProcessor {
  pub work: Duration,
}

#[async_trait]
impl TaskProcessor for ImageProcessor {
  fn task_type(&self) -> &'static str {
    "IMAGE_PROCESSING"
  }

  async fn execute(&self, payload: &str) -> ProcessingResult {
    let payload = parse(payload)?;
    let image_url = required_str(&payload, "imageUrl")?;
    let width = required_positive(&payload, "width")?;
    let height = required_positive(&payload, "height")?;
    info!("Resizing {} to {}x{}", image_url, width, height);
    sleep(self.work).await;
    Ok(json!({
      "originalUrl": image_url,
      "processedUrl": format!("{}?w={}&h={}", image_url, width, height),
      "width": width,
      "height": height,
    }).to_string())
  }
}

pub struct DataAnalysisProcessor {
  pub work: Duration,
}

#[async_trait]
impl TaskProcessor for DataAnalysisProcessor {
  fn task_type(&self) -> &'static str {
    "DATA_ANALYSIS"
  }

  async fn execute(&self, payload: &str) -> ProcessingResult {
    let payload = parse(payload)?;
    let dataset = required_str(&payload, "dataset")?;
    let analysis_type = required_str(&payload, "analysisType")?;
    info!("Running {} analysis on {}", analysis_type, dataset);
    sleep(self.work).await;
    let (average, records) = {
      let mut rng = rand::thread_rng();
      (42.5 + rng.gen_range(0.0..10.0), rng.gen_range(1_000..6_000))
    };
    Ok(json!({
      "dataset": dataset,
      "analysisType": analysis_type,
      "averageValue": average,
      "processedRecords": records,
    }).to_string())
  }
}
