use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;
use crate::clock::Clock;
use crate::error::{CoreError, Result};
use crate::messaging::DispatchChannel;
use crate::models::{Heartbeat, Page, Task, TaskStatus, WorkerHealth, WorkerOutcome, WorkerStatus};
use super::{apply_outcome, publish_locked, TaskRepository, Transition, WorkerRepository};

/// Committed tasks plus one write lock per task. Readers only see committed state,
/// writers on the same id queue behind each other.
#[derive(Default)]
pub struct MemoryTaskRepository {
  tasks: Mutex<HashMap<Uuid, Task>>,
  row_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl MemoryTaskRepository {
  pub fn new() -> Self {
    Self::default()
  }

  async fn row_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
    self.row_locks.lock().await.entry(id).or_default().clone()
  }

  async fn committed(&self, id: Uuid) -> Result<Task> {
    self.tasks.lock().await.get(&id).cloned().ok_or_else(|| CoreError::task_not_found(id))
  }

  /// A task deleted while the row was locked stays deleted.
  async fn commit(&self, task: Task) -> Result<Task> {
    let mut tasks = self.tasks.lock().await;
    let stored = tasks.get_mut(&task.id).ok_or_else(|| CoreError::task_not_found(task.id))?;
    *stored = task.clone();
    Ok(task)
  }
}

#[async_trait]
impl TaskRepository for MemoryTaskRepository {
  async fn insert(&self, task: &Task) -> Result<()> {
    self.tasks.lock().await.insert(task.id, task.clone());
    Ok(())
  }

  async fn get(&self, id: Uuid) -> Result<Option<Task>> {
    Ok(self.tasks.lock().await.get(&id).cloned())
  }

  async fn delete(&self, id: Uuid) -> Result<bool> {
    self.row_locks.lock().await.remove(&id);
    Ok(self.tasks.lock().await.remove(&id).is_some())
  }

  async fn update(&self, id: Uuid, transition: Transition<'_>) -> Result<Task> {
    let lock = self.row_lock(id).await;
    let _row = lock.lock().await;
    let mut next = self.committed(id).await?;
    transition(&mut next)?;
    self.commit(next).await
  }

  async fn hand_off(&self, id: Uuid, channel: &dyn DispatchChannel, clock: &dyn Clock) -> Result<Task> {
    let lock = self.row_lock(id).await;
    let _row = lock.lock().await;
    let current = self.committed(id).await?;
    let next = publish_locked(&current, channel, clock).await?;
    self.commit(next).await
  }

  async fn list(&self, status: Option<TaskStatus>, page: u32, size: u32) -> Result<Page<Task>> {
    let tasks = self.tasks.lock().await;
    let mut matching: Vec<&Task> = tasks
      .values()
      .filter(|t| status.is_none_or(|s| t.status == s))
      .collect();
    matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
    let total_elements = matching.len() as u64;
    let content = matching
      .into_iter()
      .skip(page as usize * size as usize)
      .take(size as usize)
      .cloned()
      .collect();
    Ok(Page { content, page, size, total_elements })
  }

  async fn find_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
    let tasks = self.tasks.lock().await;
    Ok(tasks.values().filter(|t| t.status == status).cloned().collect())
  }

  async fn count_by_status(&self) -> Result<BTreeMap<TaskStatus, u64>> {
    let tasks = self.tasks.lock().await;
    let mut counts = BTreeMap::new();
    for task in tasks.values() {
      *counts.entry(task.status).or_insert(0) += 1;
    }
    Ok(counts)
  }

  async fn count_for_worker(&self, worker_id: &str, status: TaskStatus) -> Result<u64> {
    let tasks = self.tasks.lock().await;
    Ok(tasks
      .values()
      .filter(|t| t.status == status && t.worker_id.as_deref() == Some(worker_id))
      .count() as u64)
  }
}

#[derive(Default)]
pub struct MemoryWorkerRepository {
  workers: Mutex<HashMap<String, WorkerHealth>>,
}

impl MemoryWorkerRepository {
  pub fn new() -> Self {
    Self::default()
  }

  /// Seeds a record as-is. Lets tests place a worker at an arbitrary point in time.
  pub async fn put(&self, worker: WorkerHealth) {
    self.workers.lock().await.insert(worker.worker_id.clone(), worker);
  }
}

#[async_trait]
impl WorkerRepository for MemoryWorkerRepository {
  async fn upsert_heartbeat(&self, heartbeat: &Heartbeat, now: DateTime<Utc>) -> Result<WorkerHealth> {
    let mut workers = self.workers.lock().await;
    let worker = workers
      .entry(heartbeat.worker_id.clone())
      .and_modify(|w| w.apply_heartbeat(heartbeat, now))
      .or_insert_with(|| WorkerHealth::register(heartbeat, now));
    Ok(worker.clone())
  }

  async fn get(&self, worker_id: &str) -> Result<Option<WorkerHealth>> {
    Ok(self.workers.lock().await.get(worker_id).cloned())
  }

  async fn list(&self) -> Result<Vec<WorkerHealth>> {
    let workers = self.workers.lock().await;
    let mut all: Vec<WorkerHealth> = workers.values().cloned().collect();
    all.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
    Ok(all)
  }

  async fn record_outcome(&self, worker_id: &str, outcome: WorkerOutcome) -> Result<bool> {
    let mut workers = self.workers.lock().await;
    match workers.get_mut(worker_id) {
      Some(worker) => {
        apply_outcome(worker, outcome);
        Ok(true)
      }
      None => Ok(false),
    }
  }

  async fn mark_offline_before(&self, threshold: DateTime<Utc>) -> Result<Vec<String>> {
    let mut workers = self.workers.lock().await;
    let mut changed = Vec::new();
    for worker in workers.values_mut() {
      if worker.last_heartbeat < threshold && worker.status != WorkerStatus::Offline {
        worker.status = WorkerStatus::Offline;
        changed.push(worker.worker_id.clone());
      }
    }
    changed.sort();
    Ok(changed)
  }
}
