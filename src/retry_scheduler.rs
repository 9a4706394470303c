use std::collections::BinaryHeap;
use std::cmp::Ordering;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;
use crate::clock::Clock;

/// delay(attempt) = base × 2^(attempt − 1), optionally stretched by up to 10%.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
  pub base_delay: Duration,
  pub jitter: bool,
}

impl Default for BackoffPolicy {
  fn default() -> Self {
    Self { base_delay: Duration::from_secs(1), jitter: false }
  }
}

impl BackoffPolicy {
  /// `attempt` is the retry count after the failing attempt was recorded, starting at 1.
  pub fn delay(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    self.base_delay.saturating_mul(1u32 << exponent)
  }

  /// Jitter only ever lengthens the delay, so re-delivery is never early.
  pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
    let delay = self.delay(attempt);
    if !self.jitter {
      return delay;
    }
    let stretch = rand::thread_rng().gen_range(0.0..=0.1);
    delay.saturating_add(delay.mul_f64(stretch))
  }
}

#[derive(Debug, Clone, Copy)]
pub struct ScheduledRetry {
  pub due: DateTime<Utc>,
  pub task_id: Uuid,
  pub attempt: u32,
}

impl Eq for ScheduledRetry {}

impl PartialEq for ScheduledRetry {
  fn eq(&self, other: &Self) -> bool {
    self.due == other.due && self.task_id == other.task_id
  }
}

impl PartialOrd for ScheduledRetry {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

// Reversed so the max-heap pops the earliest due time first.
impl Ord for ScheduledRetry {
  fn cmp(&self, other: &Self) -> Ordering {
    other.due.cmp(&self.due).then_with(|| other.task_id.cmp(&self.task_id))
  }
}

/// Deferred re-enqueue of RETRYING tasks. Nothing here blocks a caller: `schedule` only
/// records a due time, and `run` drains due entries on its own ticker.
pub struct RetryScheduler {
  queue: Mutex<BinaryHeap<ScheduledRetry>>,
  policy: BackoffPolicy,
  clock: Arc<dyn Clock>,
}

impl RetryScheduler {
  pub fn new(policy: BackoffPolicy, clock: Arc<dyn Clock>) -> Self {
    Self {
      queue: Mutex::new(BinaryHeap::new()),
      policy,
      clock,
    }
  }

  pub fn policy(&self) -> BackoffPolicy {
    self.policy
  }

  /// Measured from `failed_at`, the moment the failure was recorded.
  pub async fn schedule(&self, task_id: Uuid, attempt: u32, failed_at: DateTime<Utc>) -> ScheduledRetry {
    let delay = self.policy.delay_with_jitter(attempt);
    // Past the calendar's end the entry simply never comes due.
    let due = chrono::Duration::from_std(delay)
      .ok()
      .and_then(|delay| failed_at.checked_add_signed(delay))
      .unwrap_or(DateTime::<Utc>::MAX_UTC);
    let entry = ScheduledRetry { due, task_id, attempt };
    self.queue.lock().await.push(entry);
    info!("Task {} will retry in {}ms (attempt {})", task_id, delay.as_millis(), attempt);
    entry
  }

  /// Pop everything whose due time has passed on the injected clock.
  pub async fn take_due(&self) -> Vec<ScheduledRetry> {
    let now = self.clock.now();
    let mut queue = self.queue.lock().await;
    let mut due = Vec::new();
    while queue.peek().is_some_and(|next| next.due <= now) {
      if let Some(entry) = queue.pop() {
        due.push(entry);
      }
    }
    due
  }

  pub async fn next_due(&self) -> Option<DateTime<Utc>> {
    self.queue.lock().await.peek().map(|entry| entry.due)
  }

  pub async fn pending(&self) -> usize {
    self.queue.lock().await.len()
  }

  pub async fn run<F, Fut>(self: Arc<Self>, tick: Duration, requeue: F)
  where
    F: Fn(Uuid) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
      interval.tick().await;
      for entry in self.take_due().await {
        debug!("Retry due for task {} (attempt {})", entry.task_id, entry.attempt);
        tokio::spawn(requeue(entry.task_id));
      }
    }
  }
}
