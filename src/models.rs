use serde::{Serialize, Deserialize};
use uuid::Uuid;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use crate::error::{CoreError, Result};

pub const DEFAULT_PRIORITY: u8 = 5;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
  Pending,
  Queued,
  Processing,
  Completed,
  Failed,
  Retrying,
}

impl TaskStatus {
  pub const ALL: [TaskStatus; 6] = [
    TaskStatus::Pending,
    TaskStatus::Queued,
    TaskStatus::Processing,
    TaskStatus::Completed,
    TaskStatus::Failed,
    TaskStatus::Retrying,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      TaskStatus::Pending => "PENDING",
      TaskStatus::Queued => "QUEUED",
      TaskStatus::Processing => "PROCESSING",
      TaskStatus::Completed => "COMPLETED",
      TaskStatus::Failed => "FAILED",
      TaskStatus::Retrying => "RETRYING",
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, TaskStatus::Completed | TaskStatus::Failed)
  }
}

impl fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for TaskStatus {
  type Err = CoreError;

  fn from_str(s: &str) -> Result<Self> {
    TaskStatus::ALL
      .into_iter()
      .find(|status| status.as_str().eq_ignore_ascii_case(s))
      .ok_or_else(|| CoreError::Validation(format!("Unknown task status '{}'", s)))
  }
}

/// What the store decided after a worker reported a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
  /// The task is RETRYING; `attempt` is the post-increment retry count.
  Retry { attempt: u32 },
  Terminal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
  pub id: Uuid,
  #[serde(rename = "type")]
  pub task_type: String,
  pub status: TaskStatus,
  pub payload: String,
  pub result: Option<String>,
  pub retry_count: u32,
  pub max_retries: u32,
  pub priority: u8,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
  pub worker_id: Option<String>,
  pub error_message: Option<String>,
}

impl Task {
  pub fn new(submission: NewTask, now: DateTime<Utc>) -> Self {
    Self {
      id: Uuid::new_v4(),
      task_type: submission.task_type,
      status: TaskStatus::Pending,
      payload: submission.payload,
      result: None,
      retry_count: 0,
      max_retries: submission.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
      priority: submission.priority.unwrap_or(DEFAULT_PRIORITY),
      created_at: now,
      updated_at: now,
      started_at: None,
      completed_at: None,
      worker_id: None,
      error_message: None,
    }
  }

  fn expect(&self, allowed: &[TaskStatus]) -> Result<()> {
    if allowed.contains(&self.status) {
      return Ok(());
    }
    let expected = allowed.iter().map(TaskStatus::as_str).collect::<Vec<_>>().join(" or ");
    Err(CoreError::Conflict {
      id: self.id.to_string(),
      expected,
      actual: self.status.to_string(),
    })
  }

  /// Hand-off to the dispatch channel, either fresh or after a retry delay.
  pub fn mark_queued(&mut self, now: DateTime<Utc>) -> Result<()> {
    self.expect(&[TaskStatus::Pending, TaskStatus::Retrying])?;
    self.status = TaskStatus::Queued;
    self.updated_at = now;
    Ok(())
  }

  /// The publish never reached the channel, so the task is never QUEUED.
  /// Goes straight to FAILED without touching `retry_count`.
  pub fn fail_handoff(&mut self, error: &str, now: DateTime<Utc>) -> Result<()> {
    self.expect(&[TaskStatus::Pending, TaskStatus::Retrying])?;
    self.status = TaskStatus::Failed;
    self.error_message = Some(format!("Failed to queue: {}", error));
    self.completed_at = Some(now);
    self.updated_at = now;
    Ok(())
  }

  pub fn claim(&mut self, worker_id: &str, now: DateTime<Utc>) -> Result<()> {
    self.expect(&[TaskStatus::Queued])?;
    self.status = TaskStatus::Processing;
    self.worker_id = Some(worker_id.to_string());
    self.started_at.get_or_insert(now);
    self.updated_at = now;
    Ok(())
  }

  pub fn complete(&mut self, result: String, now: DateTime<Utc>) -> Result<()> {
    self.expect(&[TaskStatus::Processing])?;
    self.status = TaskStatus::Completed;
    self.result = Some(result);
    self.completed_at = Some(now);
    self.updated_at = now;
    Ok(())
  }

  pub fn fail(&mut self, error: &str, retryable: bool, now: DateTime<Utc>) -> Result<FailureOutcome> {
    self.expect(&[TaskStatus::Processing])?;
    self.error_message = Some(error.to_string());
    self.updated_at = now;
    if retryable && self.retry_count < self.max_retries {
      self.retry_count += 1;
      self.status = TaskStatus::Retrying;
      return Ok(FailureOutcome::Retry { attempt: self.retry_count });
    }
    self.status = TaskStatus::Failed;
    self.completed_at = Some(now);
    Ok(FailureOutcome::Terminal)
  }

  pub fn to_message(&self) -> crate::messaging::TaskMessage {
    crate::messaging::TaskMessage {
      task_id: self.id,
      task_type: self.task_type.clone(),
      payload: self.payload.clone(),
      priority: self.priority,
    }
  }
}

/// A submission as received. `TaskStore::submit` checks bounds
/// before a `Task` is ever created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
  #[serde(rename = "type")]
  pub task_type: String,
  pub payload: String,
  pub priority: Option<u8>,
  pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
  Online,
  Offline,
  Busy,
  Idle,
}

impl WorkerStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      WorkerStatus::Online => "ONLINE",
      WorkerStatus::Offline => "OFFLINE",
      WorkerStatus::Busy => "BUSY",
      WorkerStatus::Idle => "IDLE",
    }
  }
}

impl fmt::Display for WorkerStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for WorkerStatus {
  type Err = CoreError;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "ONLINE" => Ok(WorkerStatus::Online),
      "OFFLINE" => Ok(WorkerStatus::Offline),
      "BUSY" => Ok(WorkerStatus::Busy),
      "IDLE" => Ok(WorkerStatus::Idle),
      other => Err(CoreError::Corrupt(format!("unknown worker status '{}'", other))),
    }
  }
}

/// The only statuses a worker may claim for itself. OFFLINE is reserved for the staleness sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportedStatus {
  Busy,
  Idle,
}

impl From<ReportedStatus> for WorkerStatus {
  fn from(status: ReportedStatus) -> Self {
    match status {
      ReportedStatus::Busy => WorkerStatus::Busy,
      ReportedStatus::Idle => WorkerStatus::Idle,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
  pub worker_id: String,
  /// Absent means the worker is alive but has no load information yet (ONLINE).
  pub status: Option<ReportedStatus>,
  #[serde(default)]
  pub active_tasks: u32,
  pub cpu_usage: Option<f64>,
  pub memory_usage: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerHealth {
  pub worker_id: String,
  pub status: WorkerStatus,
  pub last_heartbeat: DateTime<Utc>,
  pub active_tasks: u32,
  pub total_processed: u64,
  pub total_failed: u64,
  pub cpu_usage: Option<f64>,
  pub memory_usage: Option<f64>,
  pub registered_at: DateTime<Utc>,
}

impl WorkerHealth {
  pub fn register(heartbeat: &Heartbeat, now: DateTime<Utc>) -> Self {
    let mut worker = Self {
      worker_id: heartbeat.worker_id.clone(),
      status: WorkerStatus::Online,
      last_heartbeat: now,
      active_tasks: 0,
      total_processed: 0,
      total_failed: 0,
      cpu_usage: None,
      memory_usage: None,
      registered_at: now,
    };
    worker.apply_heartbeat(heartbeat, now);
    worker
  }

  /// Last write wins; counters and `registered_at` are left alone.
  pub fn apply_heartbeat(&mut self, heartbeat: &Heartbeat, now: DateTime<Utc>) {
    self.status = heartbeat.status.map(WorkerStatus::from).unwrap_or(WorkerStatus::Online);
    self.last_heartbeat = now;
    self.active_tasks = heartbeat.active_tasks;
    self.cpu_usage = heartbeat.cpu_usage;
    self.memory_usage = heartbeat.memory_usage;
  }

  pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
    self.last_heartbeat < now - timeout
  }

  /// Status as observers should see it: a stale worker is OFFLINE even before the sweep gets to it.
  pub fn observed(mut self, now: DateTime<Utc>, timeout: Duration) -> Self {
    if self.is_stale(now, timeout) {
      self.status = WorkerStatus::Offline;
    }
    self
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
  Claimed,
  Processed,
  Released,
  Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatistics {
  pub total_tasks: u64,
  pub completed_tasks: u64,
  pub failed_tasks: u64,
  pub processing_tasks: u64,
  pub pending_tasks: u64,
  pub retrying_tasks: u64,
  pub success_rate: f64,
  pub active_workers: u64,
  pub status_counts: BTreeMap<TaskStatus, u64>,
}

impl TaskStatistics {
  pub fn from_counts(status_counts: BTreeMap<TaskStatus, u64>, active_workers: u64) -> Self {
    let count = |status: TaskStatus| status_counts.get(&status).copied().unwrap_or(0);
    let total_tasks = status_counts.values().sum();
    let completed_tasks = count(TaskStatus::Completed);
    let success_rate = if total_tasks > 0 {
      completed_tasks as f64 / total_tasks as f64 * 100.0
    } else {
      0.0
    };
    Self {
      total_tasks,
      completed_tasks,
      failed_tasks: count(TaskStatus::Failed),
      processing_tasks: count(TaskStatus::Processing),
      pending_tasks: count(TaskStatus::Pending) + count(TaskStatus::Queued),
      retrying_tasks: count(TaskStatus::Retrying),
      success_rate,
      active_workers,
      status_counts,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatistics {
  pub worker_id: String,
  pub completed_tasks: u64,
  pub failed_tasks: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
  pub content: Vec<T>,
  pub page: u32,
  pub size: u32,
  pub total_elements: u64,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn submission(max_retries: u32) -> NewTask {
    NewTask {
      task_type: "X".into(),
      payload: "{}".into(),
      priority: None,
      max_retries: Some(max_retries),
    }
  }

  #[test]
  fn new_task_takes_defaults() {
    let now = Utc::now();
    let task = Task::new(NewTask { max_retries: None, ..submission(0) }, now);
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.priority, DEFAULT_PRIORITY);
    assert_eq!(task.max_retries, DEFAULT_MAX_RETRIES);
    assert_eq!(task.retry_count, 0);
    assert!(task.completed_at.is_none());
  }

  #[test]
  fn claim_requires_queued() {
    let now = Utc::now();
    let mut task = Task::new(submission(3), now);
    let err = task.claim("w1", now).unwrap_err();
    assert!(matches!(err, CoreError::Conflict { .. }));
    assert_eq!(task.status, TaskStatus::Pending);

    task.mark_queued(now).unwrap();
    task.claim("w1", now).unwrap();
    assert_eq!(task.worker_id.as_deref(), Some("w1"));
    assert_eq!(task.started_at, Some(now));
  }

  #[test]
  fn started_at_is_set_once() {
    let t0 = Utc::now();
    let t1 = t0 + Duration::seconds(5);
    let mut task = Task::new(submission(3), t0);
    task.mark_queued(t0).unwrap();
    task.claim("w1", t0).unwrap();
    task.fail("boom", true, t0).unwrap();
    task.mark_queued(t1).unwrap();
    task.claim("w2", t1).unwrap();
    assert_eq!(task.started_at, Some(t0));
    assert_eq!(task.worker_id.as_deref(), Some("w2"));
  }

  #[test]
  fn retries_stop_at_max() {
    let now = Utc::now();
    let mut task = Task::new(submission(2), now);
    task.mark_queued(now).unwrap();

    for expected in 1..=2 {
      task.claim("w1", now).unwrap();
      let outcome = task.fail("boom", true, now).unwrap();
      assert_eq!(outcome, FailureOutcome::Retry { attempt: expected });
      assert_eq!(task.status, TaskStatus::Retrying);
      assert!(task.completed_at.is_none());
      task.mark_queued(now).unwrap();
    }

    task.claim("w1", now).unwrap();
    assert_eq!(task.fail("boom", true, now).unwrap(), FailureOutcome::Terminal);
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 2);
    assert!(task.completed_at.is_some());
  }

  #[test]
  fn non_retryable_failure_is_terminal_without_consuming_a_retry() {
    let now = Utc::now();
    let mut task = Task::new(submission(3), now);
    task.mark_queued(now).unwrap();
    task.claim("w1", now).unwrap();
    assert_eq!(task.fail("no processor", false, now).unwrap(), FailureOutcome::Terminal);
    assert_eq!(task.retry_count, 0);
    assert_eq!(task.error_message.as_deref(), Some("no processor"));
  }

  #[test]
  fn outcome_reports_require_processing() {
    let now = Utc::now();
    let mut task = Task::new(submission(3), now);
    task.mark_queued(now).unwrap();
    assert!(matches!(task.complete("{}".into(), now), Err(CoreError::Conflict { .. })));
    assert!(matches!(task.fail("x", true, now), Err(CoreError::Conflict { .. })));
    assert_eq!(task.status, TaskStatus::Queued);
  }

  #[test]
  fn handoff_failure_sets_completed_at() {
    let now = Utc::now();
    let mut task = Task::new(submission(3), now);
    task.fail_handoff("connection refused", now).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 0);
    assert!(task.completed_at.is_some());
    assert!(task.error_message.unwrap().contains("connection refused"));
  }

  #[test]
  fn queued_task_cannot_fail_its_handoff() {
    let now = Utc::now();
    let mut task = Task::new(submission(3), now);
    task.mark_queued(now).unwrap();
    assert!(matches!(task.fail_handoff("late", now), Err(CoreError::Conflict { .. })));
    assert_eq!(task.status, TaskStatus::Queued);
  }

  #[test]
  fn status_parses_case_insensitively() {
    assert_eq!("retrying".parse::<TaskStatus>().unwrap(), TaskStatus::Retrying);
    assert!("DONE".parse::<TaskStatus>().is_err());
  }

  #[test]
  fn stale_worker_is_observed_offline() {
    let now = Utc::now();
    let heartbeat = Heartbeat {
      worker_id: "w1".into(),
      status: Some(ReportedStatus::Busy),
      active_tasks: 2,
      cpu_usage: Some(12.5),
      memory_usage: None,
    };
    let worker = WorkerHealth::register(&heartbeat, now - Duration::seconds(61));
    assert_eq!(worker.status, WorkerStatus::Busy);
    let observed = worker.observed(now, Duration::seconds(60));
    assert_eq!(observed.status, WorkerStatus::Offline);
  }

  #[test]
  fn statistics_fold_pending_and_queued() {
    let mut counts = BTreeMap::new();
    counts.insert(TaskStatus::Pending, 1);
    counts.insert(TaskStatus::Queued, 2);
    counts.insert(TaskStatus::Completed, 1);
    let stats = TaskStatistics::from_counts(counts, 3);
    assert_eq!(stats.total_tasks, 4);
    assert_eq!(stats.pending_tasks, 3);
    assert_eq!(stats.success_rate, 25.0);
    assert_eq!(stats.active_workers, 3);
  }
}
