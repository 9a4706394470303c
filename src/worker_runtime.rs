use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::System;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use crate::error::{CoreError, Result};
use crate::messaging::TaskMessage;
use crate::models::{Heartbeat, ReportedStatus};
use crate::task_store::TaskStore;
use crate::worker_processing::{ProcessingError, ProcessorRegistry};

/// The calls a worker makes against the task store.
#[async_trait]
pub trait CoreClient: Send + Sync {
  async fn claim(&self, task_id: Uuid, worker_id: &str) -> Result<()>;
  async fn complete(&self, task_id: Uuid, result: &str) -> Result<()>;
  async fn fail(&self, task_id: Uuid, error_message: &str, retryable: bool) -> Result<()>;
  async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<()>;
}

/// Workers embedded in the API process talk to the store directly.
#[async_trait]
impl CoreClient for TaskStore {
  async fn claim(&self, task_id: Uuid, worker_id: &str) -> Result<()> {
    TaskStore::claim(self, task_id, worker_id).await.map(|_| ())
  }

  async fn complete(&self, task_id: Uuid, result: &str) -> Result<()> {
    TaskStore::complete(self, task_id, result.to_string()).await.map(|_| ())
  }

  async fn fail(&self, task_id: Uuid, error_message: &str, retryable: bool) -> Result<()> {
    TaskStore::fail(self, task_id, error_message, retryable).await.map(|_| ())
  }

  async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<()> {
    self.workers().heartbeat(heartbeat).await.map(|_| ())
  }
}

/// What the consumer should do with a delivery once the runtime is done with it.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
  Ack,
  /// Put it back for another consumer. Used once per message.
  Requeue,
  /// Divert with a reason, then ack.
  DeadLetter(String),
}

/// CPU and memory sampling for heartbeats.
pub struct ResourceSampler {
  system: Mutex<System>,
}

impl ResourceSampler {
  pub fn new() -> Self {
    let mut system = System::new();
    system.refresh_cpu_usage();
    system.refresh_memory();
    Self { system: Mutex::new(system) }
  }

  /// (cpu %, memory %)
  pub fn sample(&self) -> (Option<f64>, Option<f64>) {
    let Ok(mut system) = self.system.lock() else {
      return (None, None);
    };
    system.refresh_cpu_usage();
    system.refresh_memory();
    let cpu = system.global_cpu_usage() as f64;
    let total = system.total_memory();
    let memory = (total > 0).then(|| system.used_memory() as f64 / total as f64 * 100.0);
    (Some(cpu), memory)
  }
}

impl Default for ResourceSampler {
  fn default() -> Self {
    Self::new()
  }
}

pub struct WorkerRuntime {
  worker_id: String,
  client: Arc<dyn CoreClient>,
  processors: ProcessorRegistry,
  sampler: Option<ResourceSampler>,
  active: AtomicU32,
}

impl WorkerRuntime {
  pub fn new(worker_id: impl Into<String>, client: Arc<dyn CoreClient>, processors: ProcessorRegistry) -> Self {
    Self {
      worker_id: worker_id.into(),
      client,
      processors,
      sampler: None,
      active: AtomicU32::new(0),
    }
  }

  pub fn with_sampler(mut self, sampler: ResourceSampler) -> Self {
    self.sampler = Some(sampler);
    self
  }

  pub fn worker_id(&self) -> &str {
    &self.worker_id
  }

  pub fn active_tasks(&self) -> u32 {
    self.active.load(Ordering::SeqCst)
  }

  /// Decode, claim, dispatch, report. `redelivered` is the broker's flag; a message
  /// that already came back once is not requeued again.
  pub async fn handle(&self, raw: &[u8], redelivered: bool) -> Disposition {
    let message = match TaskMessage::from_bytes(raw) {
      Ok(message) => message,
      Err(e) => {
        error!("Failed to parse task message: {}", e);
        return Disposition::DeadLetter(format!("Malformed task message: {}", e));
      }
    };

    match self.client.claim(message.task_id, &self.worker_id).await {
      Ok(()) => {}
      Err(e @ (CoreError::Conflict { .. } | CoreError::NotFound { .. })) => {
        // Duplicate delivery, or deleted since it was queued.
        info!("Skipping task {}: {}", message.task_id, e);
        return Disposition::Ack;
      }
      Err(e) if redelivered => {
        error!("Claim for task {} failed again: {}", message.task_id, e);
        return Disposition::DeadLetter(format!("Claim failed after redelivery: {}", e));
      }
      Err(e) => {
        warn!("Claim for task {} failed, requeueing: {}", message.task_id, e);
        return Disposition::Requeue;
      }
    }

    self.active.fetch_add(1, Ordering::SeqCst);
    let disposition = self.execute(&message).await;
    self.active.fetch_sub(1, Ordering::SeqCst);
    disposition
  }

  async fn execute(&self, message: &TaskMessage) -> Disposition {
    let processor = match self.processors.get(&message.task_type) {
      Ok(processor) => processor,
      Err(e) => {
        error!("Task {}: {}", message.task_id, e);
        self.report_failure(message.task_id, &e.to_string(), false).await;
        return Disposition::DeadLetter(format!("Unroutable task type: {}", message.task_type));
      }
    };

    info!("Processing task {} of type {}", message.task_id, message.task_type);
    match processor.execute(&message.payload).await {
      Ok(result) => {
        if let Err(e) = self.client.complete(message.task_id, &result).await {
          error!("Failed to report completion of task {}: {}", message.task_id, e);
        } else {
          info!("Task {} completed", message.task_id);
        }
      }
      Err(e) => {
        warn!("Task {} failed: {}", message.task_id, e);
        let retryable = matches!(e, ProcessingError::Retryable(_));
        self.report_failure(message.task_id, &e.to_string(), retryable).await;
      }
    }
    Disposition::Ack
  }

  async fn report_failure(&self, task_id: Uuid, error_message: &str, retryable: bool) {
    if let Err(e) = self.client.fail(task_id, error_message, retryable).await {
      error!("Failed to report failure of task {}: {}", task_id, e);
    }
  }

  pub fn heartbeat(&self) -> Heartbeat {
    let active_tasks = self.active_tasks();
    let (cpu_usage, memory_usage) = self.sampler.as_ref().map(ResourceSampler::sample).unwrap_or((None, None));
    Heartbeat {
      worker_id: self.worker_id.clone(),
      status: Some(if active_tasks > 0 { ReportedStatus::Busy } else { ReportedStatus::Idle }),
      active_tasks,
      cpu_usage,
      memory_usage,
    }
  }

  /// A missed heartbeat is not retried; the next one supersedes it.
  pub async fn send_heartbeat(&self) {
    let heartbeat = self.heartbeat();
    match self.client.heartbeat(&heartbeat).await {
      Ok(()) => debug!("Heartbeat sent for worker {}", self.worker_id),
      Err(e) => warn!("Heartbeat for worker {} failed: {}", self.worker_id, e),
    }
  }

  pub async fn run_heartbeats(self: Arc<Self>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
      interval.tick().await;
      self.send_heartbeat().await;
    }
  }
}
