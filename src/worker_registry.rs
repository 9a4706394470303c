use std::sync::Arc;
use std::time::Duration;
use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, error, warn};
use crate::clock::Clock;
use crate::error::{CoreError, Result};
use crate::models::{Heartbeat, WorkerHealth, WorkerOutcome, WorkerStatus};
use crate::store::WorkerRepository;

pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

static WORKER_ID: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:@-]{0,127}$").expect("worker id pattern is valid")
});

pub fn validate_worker_id(worker_id: &str) -> Result<()> {
  if WORKER_ID.is_match(worker_id) {
    Ok(())
  } else {
    Err(CoreError::Validation(format!("Malformed worker id '{}'", worker_id)))
  }
}

/// Resource samples are advisory. One the sampler could not measure is stored as unknown.
fn usage_sample(worker_id: &str, name: &str, value: Option<f64>) -> Option<f64> {
  match value {
    Some(v) if !v.is_finite() || v < 0.0 => {
      warn!("Dropping {} {} reported by worker {}", name, v, worker_id);
      None
    }
    other => other,
  }
}

pub struct WorkerRegistry {
  repo: Arc<dyn WorkerRepository>,
  clock: Arc<dyn Clock>,
  timeout: chrono::Duration,
}

impl WorkerRegistry {
  pub fn new(repo: Arc<dyn WorkerRepository>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
    Self {
      repo,
      clock,
      timeout: chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::seconds(60)),
    }
  }

  pub async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<WorkerHealth> {
    validate_worker_id(&heartbeat.worker_id)?;
    let heartbeat = Heartbeat {
      cpu_usage: usage_sample(&heartbeat.worker_id, "cpuUsage", heartbeat.cpu_usage),
      memory_usage: usage_sample(&heartbeat.worker_id, "memoryUsage", heartbeat.memory_usage),
      ..heartbeat.clone()
    };
    let worker = self.repo.upsert_heartbeat(&heartbeat, self.clock.now()).await?;
    debug!("Updated heartbeat for worker: {}", heartbeat.worker_id);
    Ok(worker)
  }

  pub async fn get(&self, worker_id: &str) -> Result<WorkerHealth> {
    let now = self.clock.now();
    self
      .repo
      .get(worker_id)
      .await?
      .map(|w| w.observed(now, self.timeout))
      .ok_or_else(|| CoreError::worker_not_found(worker_id))
  }

  pub async fn list(&self) -> Result<Vec<WorkerHealth>> {
    let now = self.clock.now();
    Ok(self
      .repo
      .list()
      .await?
      .into_iter()
      .map(|w| w.observed(now, self.timeout))
      .collect())
  }

  pub async fn active_count(&self) -> Result<u64> {
    Ok(self.list().await?.iter().filter(|w| w.status != WorkerStatus::Offline).count() as u64)
  }

  /// Counter bookkeeping for a task outcome. A worker that never sent a heartbeat has
  /// no record to update, which is logged and otherwise ignored.
  pub async fn record(&self, worker_id: &str, outcome: WorkerOutcome) -> Result<()> {
    if !self.repo.record_outcome(worker_id, outcome).await? {
      warn!("No health record for worker {}, skipping {:?}", worker_id, outcome);
    }
    Ok(())
  }

  /// The only writer of OFFLINE.
  pub async fn sweep(&self) -> Result<Vec<String>> {
    let threshold = self.clock.now() - self.timeout;
    let stale = self.repo.mark_offline_before(threshold).await?;
    for worker_id in &stale {
      warn!("Worker {} marked as OFFLINE due to missing heartbeat", worker_id);
    }
    Ok(stale)
  }

  pub async fn run_sweeper(self: Arc<Self>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
      interval.tick().await;
      if let Err(e) = self.sweep().await {
        error!("Staleness sweep failed: {:?}", e);
      }
    }
  }
}
