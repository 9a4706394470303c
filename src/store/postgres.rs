use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Pool, Postgres, Transaction};
use std::collections::BTreeMap;
use uuid::Uuid;
use crate::clock::Clock;
use crate::error::{CoreError, Result};
use crate::messaging::DispatchChannel;
use crate::models::{Heartbeat, Page, Task, TaskStatus, WorkerHealth, WorkerOutcome, WorkerStatus};
use super::{publish_locked, TaskRepository, Transition, WorkerRepository};

#[derive(FromRow)]
struct TaskRow {
  id: Uuid,
  task_type: String,
  status: String,
  payload: String,
  result: Option<String>,
  retry_count: i32,
  max_retries: i32,
  priority: i16,
  created_at: DateTime<Utc>,
  updated_at: DateTime<Utc>,
  started_at: Option<DateTime<Utc>>,
  completed_at: Option<DateTime<Utc>>,
  worker_id: Option<String>,
  error_message: Option<String>,
}

impl TryFrom<TaskRow> for Task {
  type Error = CoreError;

  fn try_from(row: TaskRow) -> Result<Self> {
    let status = row.status.parse().map_err(|_| CoreError::Corrupt(format!("task {} has status '{}'", row.id, row.status)))?;
    Ok(Task {
      id: row.id,
      task_type: row.task_type,
      status,
      payload: row.payload,
      result: row.result,
      retry_count: row.retry_count.max(0) as u32,
      max_retries: row.max_retries.max(0) as u32,
      priority: row.priority.clamp(1, 10) as u8,
      created_at: row.created_at,
      updated_at: row.updated_at,
      started_at: row.started_at,
      completed_at: row.completed_at,
      worker_id: row.worker_id,
      error_message: row.error_message,
    })
  }
}

#[derive(FromRow)]
struct WorkerRow {
  worker_id: String,
  status: String,
  last_heartbeat: DateTime<Utc>,
  active_tasks: i32,
  total_processed: i64,
  total_failed: i64,
  cpu_usage: Option<f64>,
  memory_usage: Option<f64>,
  registered_at: DateTime<Utc>,
}

impl TryFrom<WorkerRow> for WorkerHealth {
  type Error = CoreError;

  fn try_from(row: WorkerRow) -> Result<Self> {
    Ok(WorkerHealth {
      status: row.status.parse::<WorkerStatus>()?,
      worker_id: row.worker_id,
      last_heartbeat: row.last_heartbeat,
      active_tasks: row.active_tasks.max(0) as u32,
      total_processed: row.total_processed.max(0) as u64,
      total_failed: row.total_failed.max(0) as u64,
      cpu_usage: row.cpu_usage,
      memory_usage: row.memory_usage,
      registered_at: row.registered_at,
    })
  }
}

async fn lock_task(tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<Task> {
  let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = $1 FOR UPDATE")
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| CoreError::task_not_found(id))?;
  Task::try_from(row)
}

async fn write_task(tx: &mut Transaction<'_, Postgres>, task: &Task) -> Result<()> {
  sqlx::query(
    "UPDATE tasks
     SET status = $2, result = $3, retry_count = $4, updated_at = $5, started_at = $6,
         completed_at = $7, worker_id = $8, error_message = $9
     WHERE id = $1",
  )
    .bind(task.id)
    .bind(task.status.as_str())
    .bind(&task.result)
    .bind(task.retry_count as i32)
    .bind(task.updated_at)
    .bind(task.started_at)
    .bind(task.completed_at)
    .bind(&task.worker_id)
    .bind(&task.error_message)
    .execute(&mut **tx)
    .await?;
  Ok(())
}

#[derive(Clone)]
pub struct PgTaskRepository {
  pool: Pool<Postgres>,
}

impl PgTaskRepository {
  pub fn new(pool: Pool<Postgres>) -> Self {
    Self { pool }
  }
}

#[async_trait]
impl TaskRepository for PgTaskRepository {
  async fn insert(&self, task: &Task) -> Result<()> {
    sqlx::query(
      "INSERT INTO tasks (id, task_type, status, payload, result, retry_count, max_retries, priority,
                          created_at, updated_at, started_at, completed_at, worker_id, error_message)
       VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
    )
      .bind(task.id)
      .bind(&task.task_type)
      .bind(task.status.as_str())
      .bind(&task.payload)
      .bind(&task.result)
      .bind(task.retry_count as i32)
      .bind(task.max_retries as i32)
      .bind(task.priority as i16)
      .bind(task.created_at)
      .bind(task.updated_at)
      .bind(task.started_at)
      .bind(task.completed_at)
      .bind(&task.worker_id)
      .bind(&task.error_message)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn get(&self, id: Uuid) -> Result<Option<Task>> {
    sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = $1")
      .bind(id)
      .fetch_optional(&self.pool)
      .await?
      .map(Task::try_from)
      .transpose()
  }

  async fn delete(&self, id: Uuid) -> Result<bool> {
    let done = sqlx::query("DELETE FROM tasks WHERE id = $1")
      .bind(id)
      .execute(&self.pool)
      .await?;
    Ok(done.rows_affected() > 0)
  }

  async fn update(&self, id: Uuid, transition: Transition<'_>) -> Result<Task> {
    let mut tx = self.pool.begin().await?;
    let mut task = lock_task(&mut tx, id).await?;
    // Dropping `tx` on error rolls back and releases the row lock.
    transition(&mut task)?;
    write_task(&mut tx, &task).await?;
    tx.commit().await?;
    Ok(task)
  }

  async fn hand_off(&self, id: Uuid, channel: &dyn DispatchChannel, clock: &dyn Clock) -> Result<Task> {
    let mut tx = self.pool.begin().await?;
    let current = lock_task(&mut tx, id).await?;
    // Held across the publish: plain reads keep seeing the committed status, claims block.
    let next = publish_locked(&current, channel, clock).await?;
    write_task(&mut tx, &next).await?;
    tx.commit().await?;
    Ok(next)
  }

  async fn list(&self, status: Option<TaskStatus>, page: u32, size: u32) -> Result<Page<Task>> {
    let status = status.map(|s| s.as_str());
    let rows = sqlx::query_as::<_, TaskRow>(
      "SELECT * FROM tasks
       WHERE ($1::text IS NULL OR status = $1)
       ORDER BY created_at DESC, id
       LIMIT $2 OFFSET $3",
    )
      .bind(status)
      .bind(size as i64)
      .bind(page as i64 * size as i64)
      .fetch_all(&self.pool)
      .await?;
    let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE ($1::text IS NULL OR status = $1)")
      .bind(status)
      .fetch_one(&self.pool)
      .await?;
    Ok(Page {
      content: rows.into_iter().map(Task::try_from).collect::<Result<_>>()?,
      page,
      size,
      total_elements: total.max(0) as u64,
    })
  }

  async fn find_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
    sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE status = $1 ORDER BY updated_at")
      .bind(status.as_str())
      .fetch_all(&self.pool)
      .await?
      .into_iter()
      .map(Task::try_from)
      .collect()
  }

  async fn count_by_status(&self) -> Result<BTreeMap<TaskStatus, u64>> {
    let rows: Vec<(String, i64)> = sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
      .fetch_all(&self.pool)
      .await?;
    rows
      .into_iter()
      .map(|(status, count)| -> Result<(TaskStatus, u64)> { Ok((status.parse()?, count.max(0) as u64)) })
      .collect()
  }

  async fn count_for_worker(&self, worker_id: &str, status: TaskStatus) -> Result<u64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE worker_id = $1 AND status = $2")
      .bind(worker_id)
      .bind(status.as_str())
      .fetch_one(&self.pool)
      .await?;
    Ok(count.max(0) as u64)
  }
}

#[derive(Clone)]
pub struct PgWorkerRepository {
  pool: Pool<Postgres>,
}

impl PgWorkerRepository {
  pub fn new(pool: Pool<Postgres>) -> Self {
    Self { pool }
  }
}

#[async_trait]
impl WorkerRepository for PgWorkerRepository {
  async fn upsert_heartbeat(&self, heartbeat: &Heartbeat, now: DateTime<Utc>) -> Result<WorkerHealth> {
    let status = heartbeat.status.map(WorkerStatus::from).unwrap_or(WorkerStatus::Online);
    let row = sqlx::query_as::<_, WorkerRow>(
      "INSERT INTO worker_health (worker_id, status, last_heartbeat, active_tasks, total_processed,
                                  total_failed, cpu_usage, memory_usage, registered_at)
       VALUES ($1, $2, $3, $4, 0, 0, $5, $6, $3)
       ON CONFLICT (worker_id) DO UPDATE
       SET status = EXCLUDED.status,
           last_heartbeat = EXCLUDED.last_heartbeat,
           active_tasks = EXCLUDED.active_tasks,
           cpu_usage = EXCLUDED.cpu_usage,
           memory_usage = EXCLUDED.memory_usage
       RETURNING *",
    )
      .bind(&heartbeat.worker_id)
      .bind(status.as_str())
      .bind(now)
      .bind(heartbeat.active_tasks.min(i32::MAX as u32) as i32)
      .bind(heartbeat.cpu_usage)
      .bind(heartbeat.memory_usage)
      .fetch_one(&self.pool)
      .await?;
    WorkerHealth::try_from(row)
  }

  async fn get(&self, worker_id: &str) -> Result<Option<WorkerHealth>> {
    sqlx::query_as::<_, WorkerRow>("SELECT * FROM worker_health WHERE worker_id = $1")
      .bind(worker_id)
      .fetch_optional(&self.pool)
      .await?
      .map(WorkerHealth::try_from)
      .transpose()
  }

  async fn list(&self) -> Result<Vec<WorkerHealth>> {
    sqlx::query_as::<_, WorkerRow>("SELECT * FROM worker_health ORDER BY worker_id")
      .fetch_all(&self.pool)
      .await?
      .into_iter()
      .map(WorkerHealth::try_from)
      .collect()
  }

  async fn record_outcome(&self, worker_id: &str, outcome: WorkerOutcome) -> Result<bool> {
    let sql = match outcome {
      WorkerOutcome::Claimed => "UPDATE worker_health SET active_tasks = active_tasks + 1 WHERE worker_id = $1",
      WorkerOutcome::Processed => {
        "UPDATE worker_health
         SET total_processed = total_processed + 1, active_tasks = GREATEST(active_tasks - 1, 0)
         WHERE worker_id = $1"
      }
      WorkerOutcome::Released => {
        "UPDATE worker_health SET active_tasks = GREATEST(active_tasks - 1, 0) WHERE worker_id = $1"
      }
      WorkerOutcome::Failed => {
        "UPDATE worker_health
         SET total_failed = total_failed + 1, active_tasks = GREATEST(active_tasks - 1, 0)
         WHERE worker_id = $1"
      }
    };
    let done = sqlx::query(sql).bind(worker_id).execute(&self.pool).await?;
    Ok(done.rows_affected() > 0)
  }

  async fn mark_offline_before(&self, threshold: DateTime<Utc>) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
      "UPDATE worker_health SET status = 'OFFLINE'
       WHERE last_heartbeat < $1 AND status <> 'OFFLINE'
       RETURNING worker_id",
    )
      .bind(threshold)
      .fetch_all(&self.pool)
      .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
  }
}
