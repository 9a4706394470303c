use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use crate::clock::Clock;
use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
  pub limit: u32,
  pub window: Duration,
}

impl RateLimitPolicy {
  pub fn per_minute(limit: u32) -> Self {
    Self { limit, window: Duration::from_secs(60) }
  }

  fn window_millis(&self) -> i64 {
    self.window.as_millis().min(i64::MAX as u128) as i64
  }
}

/// Timestamps for one caller, scored in epoch milliseconds. Several requests may share a score.
#[derive(Debug, Default)]
struct WindowLog {
  scores: BTreeMap<i64, u32>,
  expires_at: i64,
}

impl WindowLog {
  /// Drops every entry with score <= `max`.
  fn remove_range_by_score(&mut self, max: i64) {
    self.scores = self.scores.split_off(&(max.saturating_add(1)));
  }

  fn count_by_score(&self, min: i64, max: i64) -> u32 {
    self.scores.range(min..=max).map(|(_, n)| *n).sum()
  }

  fn min_score_in(&self, min: i64, max: i64) -> Option<i64> {
    self.scores.range(min..=max).next().map(|(score, _)| *score)
  }

  fn add(&mut self, score: i64) {
    *self.scores.entry(score).or_insert(0) += 1;
  }
}

/// Sliding-window log limiter keyed by caller identity.
pub struct SlidingWindowLimiter {
  policy: RateLimitPolicy,
  clock: Arc<dyn Clock>,
  windows: Mutex<HashMap<String, WindowLog>>,
}

fn millis(at: DateTime<Utc>) -> i64 {
  at.timestamp_millis()
}

impl SlidingWindowLimiter {
  pub fn new(policy: RateLimitPolicy, clock: Arc<dyn Clock>) -> Self {
    Self {
      policy,
      clock,
      windows: Mutex::new(HashMap::new()),
    }
  }

  pub fn policy(&self) -> RateLimitPolicy {
    self.policy
  }

  /// Records the request and returns the quota left, or rejects with the time until the
  /// oldest request in the window falls out of it.
  pub async fn admit(&self, identity: &str) -> Result<u32> {
    let now = millis(self.clock.now());
    let window = self.policy.window_millis();
    let window_start = now - window;

    let mut windows = self.windows.lock().await;
    let log = windows.entry(identity.to_string()).or_default();
    log.remove_range_by_score(window_start);

    let count = log.count_by_score(window_start, now);
    if count >= self.policy.limit {
      let oldest = log.min_score_in(window_start, now).unwrap_or(now);
      let retry_after = Duration::from_millis((oldest + window - now).max(1) as u64);
      warn!("Rate limit exceeded for {} ({} in window)", identity, count);
      return Err(CoreError::RateLimitExceeded { retry_after });
    }

    log.add(now);
    log.expires_at = now + 2 * window;
    Ok(self.policy.limit - count - 1)
  }

  pub async fn remaining(&self, identity: &str) -> u32 {
    let now = millis(self.clock.now());
    let window_start = now - self.policy.window_millis();
    let windows = self.windows.lock().await;
    let used = windows
      .get(identity)
      .map(|log| log.count_by_score(window_start, now))
      .unwrap_or(0);
    self.policy.limit.saturating_sub(used)
  }

  pub async fn retry_after(&self, identity: &str) -> Duration {
    let now = millis(self.clock.now());
    let window = self.policy.window_millis();
    let windows = self.windows.lock().await;
    windows
      .get(identity)
      .and_then(|log| log.min_score_in(now - window, now))
      .map(|oldest| Duration::from_millis((oldest + window - now).max(0) as u64))
      .unwrap_or(Duration::ZERO)
  }

  /// Forget callers whose keys have expired. Returns how many were dropped.
  pub async fn purge_expired(&self) -> usize {
    let now = millis(self.clock.now());
    let mut windows = self.windows.lock().await;
    let before = windows.len();
    windows.retain(|_, log| log.expires_at > now);
    before - windows.len()
  }

  pub async fn tracked_identities(&self) -> usize {
    self.windows.lock().await.len()
  }

  pub async fn run_purge(self: Arc<Self>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
      interval.tick().await;
      let dropped = self.purge_expired().await;
      if dropped > 0 {
        debug!("Purged {} idle rate-limit windows", dropped);
      }
    }
  }
}
