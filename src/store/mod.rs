use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;
use crate::clock::Clock;
use crate::error::Result;
use crate::messaging::DispatchChannel;
use crate::models::{Heartbeat, Page, Task, TaskStatus, WorkerHealth, WorkerOutcome};

pub mod memory;
pub mod postgres;

pub use memory::{MemoryTaskRepository, MemoryWorkerRepository};
pub use postgres::{PgTaskRepository, PgWorkerRepository};

/// A state-machine step applied to a task under the repository's per-record lock.
/// Returning an error aborts the write and leaves the stored task untouched.
pub type Transition<'a> = Box<dyn FnOnce(&mut Task) -> Result<()> + Send + 'a>;

#[async_trait]
pub trait TaskRepository: Send + Sync {
  async fn insert(&self, task: &Task) -> Result<()>;

  async fn get(&self, id: Uuid) -> Result<Option<Task>>;

  /// Returns false when there was nothing to delete.
  async fn delete(&self, id: Uuid) -> Result<bool>;

  /// Atomic read-modify-write keyed by task id. Concurrent callers on the same id are
  /// serialized, so a transition always sees the result of the one before it.
  async fn update(&self, id: Uuid, transition: Transition<'_>) -> Result<Task>;

  /// PENDING/RETRYING → QUEUED, or → FAILED if the publish fails. The publish runs
  /// under the same per-record lock as `update`, so no reader sees QUEUED before the
  /// message exists and a competing claim waits for the outcome.
  async fn hand_off(&self, id: Uuid, channel: &dyn DispatchChannel, clock: &dyn Clock) -> Result<Task>;

  /// Newest first. `page` is zero-based.
  async fn list(&self, status: Option<TaskStatus>, page: u32, size: u32) -> Result<Page<Task>>;

  async fn find_by_status(&self, status: TaskStatus) -> Result<Vec<Task>>;

  async fn count_by_status(&self) -> Result<BTreeMap<TaskStatus, u64>>;

  async fn count_for_worker(&self, worker_id: &str, status: TaskStatus) -> Result<u64>;
}

#[async_trait]
pub trait WorkerRepository: Send + Sync {
  /// Insert on first sight, otherwise overwrite the heartbeat-derived fields in place.
  async fn upsert_heartbeat(&self, heartbeat: &Heartbeat, now: DateTime<Utc>) -> Result<WorkerHealth>;

  async fn get(&self, worker_id: &str) -> Result<Option<WorkerHealth>>;

  async fn list(&self) -> Result<Vec<WorkerHealth>>;

  /// Returns false if the worker has never sent a heartbeat.
  async fn record_outcome(&self, worker_id: &str, outcome: WorkerOutcome) -> Result<bool>;

  /// Flip every non-OFFLINE worker whose last heartbeat is older than `threshold`.
  /// Returns the ids that changed.
  async fn mark_offline_before(&self, threshold: DateTime<Utc>) -> Result<Vec<String>>;
}

/// The state a locked task moves to once its message is (or is not) on the channel.
/// A task that is not eligible for hand-off comes back as a Conflict and nothing is published.
pub(crate) async fn publish_locked(current: &Task, channel: &dyn DispatchChannel, clock: &dyn Clock) -> Result<Task> {
  let mut queued = current.clone();
  queued.mark_queued(clock.now())?;
  match channel.publish(&queued.to_message()).await {
    Ok(()) => Ok(queued),
    Err(e) => {
      let mut failed = current.clone();
      failed.fail_handoff(&e.to_string(), clock.now())?;
      Ok(failed)
    }
  }
}

pub(crate) fn apply_outcome(worker: &mut WorkerHealth, outcome: WorkerOutcome) {
  match outcome {
    WorkerOutcome::Claimed => worker.active_tasks += 1,
    WorkerOutcome::Processed => {
      worker.total_processed += 1;
      worker.active_tasks = worker.active_tasks.saturating_sub(1);
    }
    WorkerOutcome::Released => worker.active_tasks = worker.active_tasks.saturating_sub(1),
    WorkerOutcome::Failed => {
      worker.total_failed += 1;
      worker.active_tasks = worker.active_tasks.saturating_sub(1);
    }
  }
}
