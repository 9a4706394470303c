use std::sync::{Arc, LazyLock};
use regex::Regex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use crate::clock::Clock;
use crate::error::{CoreError, Result};
use crate::messaging::DispatchChannel;
use crate::models::{NewTask, Page, Task, TaskStatistics, TaskStatus, WorkerOutcome, WorkerStatistics};
use crate::rate_limiter::SlidingWindowLimiter;
use crate::retry_scheduler::RetryScheduler;
use crate::store::TaskRepository;
use crate::worker_registry::{validate_worker_id, WorkerRegistry};

pub const MAX_PRIORITY: u8 = 10;
pub const MAX_RETRY_BOUND: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 100;

static TASK_TYPE: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^[A-Za-z0-9_.\-]{1,64}$").expect("task type pattern is valid")
});

fn validate_json(field: &str, raw: &str) -> Result<()> {
  serde_json::from_str::<serde_json::Value>(raw)
    .map(|_| ())
    .map_err(|e| CoreError::Validation(format!("Invalid JSON {}: {}", field, e)))
}

pub fn validate_submission(submission: &NewTask) -> Result<()> {
  if !TASK_TYPE.is_match(&submission.task_type) {
    return Err(CoreError::Validation(format!("Invalid task type '{}'", submission.task_type)));
  }
  validate_json("payload", &submission.payload)?;
  if let Some(priority) = submission.priority {
    if !(1..=MAX_PRIORITY).contains(&priority) {
      return Err(CoreError::Validation(format!("Priority must be between 1 and {}, got {}", MAX_PRIORITY, priority)));
    }
  }
  if let Some(max_retries) = submission.max_retries {
    if max_retries > MAX_RETRY_BOUND {
      return Err(CoreError::Validation(format!("maxRetries must be at most {}, got {}", MAX_RETRY_BOUND, max_retries)));
    }
  }
  Ok(())
}

#[derive(Debug, Clone)]
pub struct Submitted {
  pub task: Task,
  /// Admissions left for this caller in the current window.
  pub remaining: u32,
}

/// Sole owner of task records. Every state change goes through one of the transition
/// methods here, each applied as a single atomic update on the repository.
pub struct TaskStore {
  repo: Arc<dyn TaskRepository>,
  channel: Arc<dyn DispatchChannel>,
  workers: Arc<WorkerRegistry>,
  retries: Arc<RetryScheduler>,
  limiter: Arc<SlidingWindowLimiter>,
  clock: Arc<dyn Clock>,
}

impl TaskStore {
  pub fn new(
    repo: Arc<dyn TaskRepository>,
    channel: Arc<dyn DispatchChannel>,
    workers: Arc<WorkerRegistry>,
    retries: Arc<RetryScheduler>,
    limiter: Arc<SlidingWindowLimiter>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self { repo, channel, workers, retries, limiter, clock }
  }

  pub fn workers(&self) -> &Arc<WorkerRegistry> {
    &self.workers
  }

  pub fn limiter(&self) -> &Arc<SlidingWindowLimiter> {
    &self.limiter
  }

  pub async fn submit(&self, caller: &str, submission: NewTask) -> Result<Submitted> {
    let remaining = self.limiter.admit(caller).await?;
    validate_submission(&submission)?;

    let task = Task::new(submission, self.clock.now());
    self.repo.insert(&task).await?;
    info!("Task created with ID: {}", task.id);

    let task = self.hand_off(task.id).await?;
    Ok(Submitted { task, remaining })
  }

  /// PENDING/RETRYING → QUEUED if the publish succeeds, FAILED with the hand-off error
  /// otherwise; no retry is consumed. The repository holds the task's lock across the
  /// publish, so readers never see QUEUED for a message that was not sent and a fast
  /// worker's claim waits until the status is settled.
  async fn hand_off(&self, id: Uuid) -> Result<Task> {
    let task = self.repo.hand_off(id, self.channel.as_ref(), self.clock.as_ref()).await?;
    match task.status {
      TaskStatus::Queued => info!("Task {} sent to queue", id),
      _ => error!("Failed to queue task {}: {}", id, task.error_message.as_deref().unwrap_or_default()),
    }
    Ok(task)
  }

  pub async fn get(&self, id: Uuid) -> Result<Task> {
    self.repo.get(id).await?.ok_or_else(|| CoreError::task_not_found(id))
  }

  pub async fn list(&self, status: Option<TaskStatus>, page: u32, size: u32) -> Result<Page<Task>> {
    if size == 0 || size > MAX_PAGE_SIZE {
      return Err(CoreError::Validation(format!("Page size must be between 1 and {}", MAX_PAGE_SIZE)));
    }
    self.repo.list(status, page, size).await
  }

  /// Unconditional; works in any state.
  pub async fn delete(&self, id: Uuid) -> Result<()> {
    if !self.repo.delete(id).await? {
      return Err(CoreError::task_not_found(id));
    }
    info!("Task {} deleted", id);
    Ok(())
  }

  pub async fn claim(&self, id: Uuid, worker_id: &str) -> Result<Task> {
    validate_worker_id(worker_id)?;
    let now = self.clock.now();
    let claimant = worker_id.to_string();
    let task = self.repo.update(id, Box::new(move |t| t.claim(&claimant, now))).await?;
    info!("Task {} marked as processing by worker {}", id, worker_id);
    self.bump(worker_id, WorkerOutcome::Claimed).await;
    Ok(task)
  }

  pub async fn complete(&self, id: Uuid, result: String) -> Result<Task> {
    validate_json("result", &result)?;
    let now = self.clock.now();
    let task = self.repo.update(id, Box::new(move |t| t.complete(result, now))).await?;
    info!("Task {} completed successfully", id);
    if let Some(worker_id) = &task.worker_id {
      self.bump(worker_id, WorkerOutcome::Processed).await;
    }
    Ok(task)
  }

  pub async fn fail(&self, id: Uuid, error_message: &str, retryable: bool) -> Result<Task> {
    let now = self.clock.now();
    let message = error_message.to_string();
    let task = self
      .repo
      .update(id, Box::new(move |t| t.fail(&message, retryable, now).map(|_| ())))
      .await?;

    match task.status {
      TaskStatus::Retrying => {
        self.retries.schedule(task.id, task.retry_count, task.updated_at).await;
        if let Some(worker_id) = &task.worker_id {
          self.bump(worker_id, WorkerOutcome::Released).await;
        }
      }
      _ => {
        error!("Task {} permanently failed after {} retries: {}", id, task.retry_count, error_message);
        if let Some(worker_id) = &task.worker_id {
          self.bump(worker_id, WorkerOutcome::Failed).await;
        }
      }
    }
    Ok(task)
  }

  /// RETRYING → QUEUED once the retry delay has elapsed. Called by the retry scheduler.
  pub async fn requeue(&self, id: Uuid) {
    match self.hand_off(id).await {
      Ok(task) if task.status == TaskStatus::Queued => debug!("Task {} re-queued (attempt {})", id, task.retry_count),
      Ok(_) => {}
      Err(CoreError::NotFound { .. }) => debug!("Task {} was deleted before its retry", id),
      Err(e) => warn!("Could not re-queue task {}: {}", id, e),
    }
  }

  /// Re-arm retries for tasks left RETRYING by a previous process.
  pub async fn recover_retries(&self) -> Result<usize> {
    let stranded = self.repo.find_by_status(TaskStatus::Retrying).await?;
    for task in &stranded {
      self.retries.schedule(task.id, task.retry_count, task.updated_at).await;
    }
    if !stranded.is_empty() {
      info!("Recovered {} tasks awaiting retry", stranded.len());
    }
    Ok(stranded.len())
  }

  /// Hand off tasks a previous process inserted but never published.
  pub async fn recover_pending(&self) -> Result<usize> {
    let stranded = self.repo.find_by_status(TaskStatus::Pending).await?;
    for task in &stranded {
      if let Err(e) = self.hand_off(task.id).await {
        warn!("Could not hand off stranded task {}: {}", task.id, e);
      }
    }
    if !stranded.is_empty() {
      info!("Recovered {} tasks never handed off", stranded.len());
    }
    Ok(stranded.len())
  }

  pub async fn statistics(&self) -> Result<TaskStatistics> {
    let counts = self.repo.count_by_status().await?;
    let active_workers = self.workers.active_count().await?;
    Ok(TaskStatistics::from_counts(counts, active_workers))
  }

  pub async fn worker_statistics(&self, worker_id: &str) -> Result<WorkerStatistics> {
    validate_worker_id(worker_id)?;
    Ok(WorkerStatistics {
      worker_id: worker_id.to_string(),
      completed_tasks: self.repo.count_for_worker(worker_id, TaskStatus::Completed).await?,
      failed_tasks: self.repo.count_for_worker(worker_id, TaskStatus::Failed).await?,
    })
  }

  // Counters are advisory; the task transition has already committed.
  async fn bump(&self, worker_id: &str, outcome: WorkerOutcome) {
    if let Err(e) = self.workers.record(worker_id, outcome).await {
      error!("Failed to record {:?} for worker {}: {}", outcome, worker_id, e);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use async_trait::async_trait;
  use tokio::sync::Notify;
  use crate::clock::ManualClock;
  use crate::messaging::{MemoryChannel, TaskMessage};
  use crate::models::{Heartbeat, ReportedStatus};
  use crate::rate_limiter::RateLimitPolicy;
  use crate::retry_scheduler::BackoffPolicy;
  use crate::store::{MemoryTaskRepository, MemoryWorkerRepository};
  use crate::worker_registry::HEARTBEAT_TIMEOUT;

  struct Harness {
    clock: Arc<ManualClock>,
    channel: Arc<MemoryChannel>,
    retries: Arc<RetryScheduler>,
    store: TaskStore,
  }

  fn harness(limit: u32) -> Harness {
    let clock = Arc::new(ManualClock::default());
    let channel = Arc::new(MemoryChannel::new());
    let workers = Arc::new(WorkerRegistry::new(Arc::new(MemoryWorkerRepository::new()), clock.clone(), HEARTBEAT_TIMEOUT));
    let retries = Arc::new(RetryScheduler::new(BackoffPolicy::default(), clock.clone()));
    let limiter = Arc::new(SlidingWindowLimiter::new(RateLimitPolicy::per_minute(limit), clock.clone()));
    let store = TaskStore::new(
      Arc::new(MemoryTaskRepository::new()),
      channel.clone(),
      workers,
      retries.clone(),
      limiter,
      clock.clone(),
    );
    Harness { clock, channel, retries, store }
  }

  /// Parks every publish until released, then reports the broker as down.
  #[derive(Default)]
  struct StalledChannel {
    entered: Notify,
    release: Notify,
  }

  #[async_trait]
  impl DispatchChannel for StalledChannel {
    async fn publish(&self, _message: &TaskMessage) -> Result<()> {
      self.entered.notify_one();
      self.release.notified().await;
      Err(CoreError::TransientDelivery("broker unreachable".into()))
    }

    async fn dead_letter(&self, _original: &[u8], _reason: &str) -> Result<()> {
      Ok(())
    }
  }

  fn submission(payload: &str) -> NewTask {
    NewTask { task_type: "X".into(), payload: payload.into(), priority: None, max_retries: Some(3) }
  }

  #[tokio::test]
  async fn submit_queues_and_publishes() {
    let h = harness(10);
    let submitted = h.store.submit("caller", submission("{}")).await.unwrap();
    assert_eq!(submitted.task.status, TaskStatus::Queued);
    assert_eq!(submitted.remaining, 9);
    let message = h.channel.pop().await.unwrap();
    assert_eq!(message.task_id, submitted.task.id);
    assert_eq!(message.priority, 5);
  }

  #[tokio::test]
  async fn malformed_payload_never_creates_a_task() {
    let h = harness(10);
    let err = h.store.submit("caller", submission("{not json")).await.unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
    assert_eq!(h.store.statistics().await.unwrap().total_tasks, 0);
    assert!(h.channel.is_empty().await);
  }

  #[tokio::test]
  async fn bounds_are_enforced_at_submission() {
    let h = harness(10);
    let bad = [
      NewTask { priority: Some(0), ..submission("{}") },
      NewTask { priority: Some(11), ..submission("{}") },
      NewTask { max_retries: Some(11), ..submission("{}") },
      NewTask { task_type: "".into(), ..submission("{}") },
      NewTask { task_type: "has space".into(), ..submission("{}") },
    ];
    for submission in bad {
      assert!(matches!(h.store.submit("caller", submission).await, Err(CoreError::Validation(_))));
    }
  }

  #[tokio::test]
  async fn unreachable_channel_fails_task_without_consuming_retry() {
    let h = harness(10);
    h.channel.set_unreachable(true);
    let submitted = h.store.submit("caller", submission("{}")).await.unwrap();
    assert_eq!(submitted.task.status, TaskStatus::Failed);
    assert_eq!(submitted.task.retry_count, 0);
    assert!(submitted.task.completed_at.is_some());
    assert!(submitted.task.error_message.unwrap().contains("unreachable"));
  }

  #[tokio::test]
  async fn rate_limited_submissions_are_rejected_before_validation() {
    let h = harness(1);
    h.store.submit("caller", submission("{}")).await.unwrap();
    let err = h.store.submit("caller", submission("{broken")).await.unwrap_err();
    assert!(matches!(err, CoreError::RateLimitExceeded { .. }));
  }

  #[tokio::test]
  async fn completion_updates_worker_counters() {
    let h = harness(10);
    h.store
      .workers()
      .heartbeat(&Heartbeat {
        worker_id: "W1".into(),
        status: Some(ReportedStatus::Idle),
        active_tasks: 0,
        cpu_usage: None,
        memory_usage: None,
      })
      .await
      .unwrap();
    let id = h.store.submit("caller", submission("{}")).await.unwrap().task.id;
    h.store.claim(id, "W1").await.unwrap();
    assert_eq!(h.store.workers().get("W1").await.unwrap().active_tasks, 1);

    let task = h.store.complete(id, "{\"ok\":true}".into()).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.completed_at.is_some());
    let worker = h.store.workers().get("W1").await.unwrap();
    assert_eq!(worker.total_processed, 1);
    assert_eq!(worker.active_tasks, 0);
    assert_eq!(h.store.worker_statistics("W1").await.unwrap().completed_tasks, 1);
  }

  #[tokio::test]
  async fn malformed_result_is_rejected_and_state_kept() {
    let h = harness(10);
    let id = h.store.submit("caller", submission("{}")).await.unwrap().task.id;
    h.store.claim(id, "W1").await.unwrap();
    assert!(matches!(h.store.complete(id, "oops".into()).await, Err(CoreError::Validation(_))));
    assert_eq!(h.store.get(id).await.unwrap().status, TaskStatus::Processing);
  }

  #[tokio::test]
  async fn retries_back_off_one_two_four_then_fail() {
    let h = harness(10);
    let id = h.store.submit("caller", submission("{}")).await.unwrap().task.id;
    h.channel.pop().await.unwrap();

    for (attempt, delay_secs) in [(1u32, 1i64), (2, 2), (3, 4)] {
      h.store.claim(id, "W1").await.unwrap();
      let failed_at = h.clock.now();
      let task = h.store.fail(id, "boom", true).await.unwrap();
      assert_eq!(task.status, TaskStatus::Retrying);
      assert_eq!(task.retry_count, attempt);
      assert_eq!(h.retries.next_due().await, Some(failed_at + chrono::Duration::seconds(delay_secs)));

      h.clock.advance(chrono::Duration::seconds(delay_secs) - chrono::Duration::milliseconds(1));
      assert!(h.retries.take_due().await.is_empty());
      h.clock.advance(chrono::Duration::milliseconds(1));
      for entry in h.retries.take_due().await {
        h.store.requeue(entry.task_id).await;
      }
      assert_eq!(h.store.get(id).await.unwrap().status, TaskStatus::Queued);
      assert_eq!(h.channel.pop().await.unwrap().task_id, id);
    }

    h.store.claim(id, "W1").await.unwrap();
    let task = h.store.fail(id, "boom", true).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 3);
    assert!(task.completed_at.is_some());
    assert_eq!(h.retries.pending().await, 0);
  }

  #[tokio::test]
  async fn outcome_for_task_not_processing_is_a_conflict() {
    let h = harness(10);
    let id = h.store.submit("caller", submission("{}")).await.unwrap().task.id;
    assert!(matches!(h.store.complete(id, "{}".into()).await, Err(CoreError::Conflict { .. })));
    assert!(matches!(h.store.fail(id, "x", true).await, Err(CoreError::Conflict { .. })));
    h.store.claim(id, "W1").await.unwrap();
    assert!(matches!(h.store.claim(id, "W2").await, Err(CoreError::Conflict { .. })));
    assert_eq!(h.store.get(id).await.unwrap().worker_id.as_deref(), Some("W1"));
  }

  #[tokio::test]
  async fn delete_is_unconditional_then_not_found() {
    let h = harness(10);
    let id = h.store.submit("caller", submission("{}")).await.unwrap().task.id;
    h.store.claim(id, "W1").await.unwrap();
    h.store.delete(id).await.unwrap();
    assert!(matches!(h.store.get(id).await, Err(CoreError::NotFound { .. })));
    assert!(matches!(h.store.delete(id).await, Err(CoreError::NotFound { .. })));
    // A late retry for a deleted task is dropped quietly.
    h.store.requeue(id).await;
  }

  #[tokio::test]
  async fn stranded_retries_are_recovered_from_last_update() {
    let h = harness(10);
    let id = h.store.submit("caller", submission("{}")).await.unwrap().task.id;
    h.store.claim(id, "W1").await.unwrap();
    let failed = h.store.fail(id, "boom", true).await.unwrap();
    h.clock.advance(chrono::Duration::minutes(5));

    // Simulates a restart: the in-memory schedule is gone, the RETRYING record is not.
    let fresh = Arc::new(RetryScheduler::new(BackoffPolicy::default(), h.clock.clone()));
    let store = TaskStore { retries: fresh.clone(), ..h.store };
    assert_eq!(store.recover_retries().await.unwrap(), 1);
    assert_eq!(fresh.next_due().await, Some(failed.updated_at + chrono::Duration::seconds(1)));
    assert_eq!(fresh.take_due().await.len(), 1);
  }

  #[tokio::test]
  async fn failed_publish_is_never_observed_as_queued() {
    let clock = Arc::new(ManualClock::default());
    let channel = Arc::new(StalledChannel::default());
    let store = Arc::new(TaskStore::new(
      Arc::new(MemoryTaskRepository::new()),
      channel.clone(),
      Arc::new(WorkerRegistry::new(Arc::new(MemoryWorkerRepository::new()), clock.clone(), HEARTBEAT_TIMEOUT)),
      Arc::new(RetryScheduler::new(BackoffPolicy::default(), clock.clone())),
      Arc::new(SlidingWindowLimiter::new(RateLimitPolicy::per_minute(10), clock.clone())),
      clock.clone(),
    ));

    let submit = tokio::spawn({
      let store = store.clone();
      async move { store.submit("caller", submission("{}")).await }
    });
    channel.entered.notified().await;

    // Publish in flight: readers see the committed status, a claim has to wait.
    let listed = store.list(None, 0, 10).await.unwrap();
    assert_eq!(listed.content.len(), 1);
    let id = listed.content[0].id;
    assert_eq!(store.get(id).await.unwrap().status, TaskStatus::Pending);
    let claim = tokio::spawn({
      let store = store.clone();
      async move { store.claim(id, "W1").await }
    });
    for _ in 0..10 {
      tokio::task::yield_now().await;
    }
    assert!(!claim.is_finished());
    assert_eq!(store.get(id).await.unwrap().status, TaskStatus::Pending);

    channel.release.notify_one();
    let task = submit.await.unwrap().unwrap().task;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 0);
    assert!(matches!(claim.await.unwrap(), Err(CoreError::Conflict { .. })));
    assert_eq!(store.get(id).await.unwrap().status, TaskStatus::Failed);
  }

  #[tokio::test]
  async fn tasks_never_handed_off_are_published_on_recovery() {
    let h = harness(10);
    let stranded = Task::new(submission("{}"), h.clock.now());
    h.store.repo.insert(&stranded).await.unwrap();

    assert_eq!(h.store.recover_pending().await.unwrap(), 1);
    assert_eq!(h.store.get(stranded.id).await.unwrap().status, TaskStatus::Queued);
    assert_eq!(h.channel.pop().await.unwrap().task_id, stranded.id);
    assert_eq!(h.store.recover_pending().await.unwrap(), 0);
  }
}
