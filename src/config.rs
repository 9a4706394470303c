use anyhow::{bail, Context};
use std::env;
use std::str::FromStr;
use std::time::Duration;

const MAX_RETRY_BASE_DELAY: Duration = Duration::from_secs(3600);

fn required(name: &str) -> anyhow::Result<String> {
  env::var(name).with_context(|| format!("{} must be set", name))
}

fn or_default<T: FromStr>(name: &str, default: T) -> anyhow::Result<T>
where
  T::Err: std::fmt::Display,
{
  match env::var(name) {
    Ok(raw) => raw
      .trim()
      .parse()
      .map_err(|e| anyhow::anyhow!("{} has an invalid value '{}': {}", name, raw, e)),
    Err(_) => Ok(default),
  }
}

#[derive(Debug, Clone)]
pub struct Config {
  pub database_url: String,
  pub rabbitmq_url: String,
  pub server_port: u16,
  pub rate_limit_per_minute: u32,
  pub heartbeat_timeout: Duration,
  pub sweep_interval: Duration,
  pub retry_base_delay: Duration,
  pub retry_jitter: bool,
  pub dispatch_timeout: Duration,
}

impl Config {
  pub fn from_env() -> anyhow::Result<Self> {
    let config = Self {
      database_url: required("DATABASE_URL")?,
      rabbitmq_url: required("RABBITMQ_URL")?,
      server_port: or_default("SERVER_PORT", 8080)?,
      rate_limit_per_minute: or_default("RATE_LIMIT_PER_MINUTE", 100)?,
      heartbeat_timeout: Duration::from_secs(or_default("HEARTBEAT_TIMEOUT_SECS", 60)?),
      sweep_interval: Duration::from_secs(or_default("SWEEP_INTERVAL_SECS", 30)?),
      retry_base_delay: Duration::from_millis(or_default("RETRY_BASE_DELAY_MS", 1000)?),
      retry_jitter: or_default("RETRY_JITTER", false)?,
      dispatch_timeout: Duration::from_millis(or_default("DISPATCH_TIMEOUT_MS", 5000)?),
    };
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> anyhow::Result<()> {
    if self.rate_limit_per_minute == 0 {
      bail!("RATE_LIMIT_PER_MINUTE must be at least 1");
    }
    if self.sweep_interval.is_zero() || self.sweep_interval >= self.heartbeat_timeout {
      bail!(
        "SWEEP_INTERVAL_SECS ({:?}) must be non-zero and shorter than HEARTBEAT_TIMEOUT_SECS ({:?})",
        self.sweep_interval,
        self.heartbeat_timeout
      );
    }
    if self.retry_base_delay.is_zero() || self.retry_base_delay > MAX_RETRY_BASE_DELAY {
      bail!(
        "RETRY_BASE_DELAY_MS ({:?}) must be positive and at most {:?}",
        self.retry_base_delay,
        MAX_RETRY_BASE_DELAY
      );
    }
    Ok(())
  }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
  pub api_url: String,
  pub rabbitmq_url: String,
  pub worker_id: String,
  pub concurrency: u16,
  pub heartbeat_interval: Duration,
  pub request_timeout: Duration,
  pub dispatch_timeout: Duration,
}

impl WorkerConfig {
  pub fn from_env() -> anyhow::Result<Self> {
    let worker_id = match env::var("WORKER_ID") {
      Ok(id) => id,
      Err(_) => format!("worker-{}", uuid::Uuid::new_v4()),
    };
    crate::worker_registry::validate_worker_id(&worker_id)?;
    let config = Self {
      api_url: or_default("API_URL", "http://localhost:8080".to_string())?,
      rabbitmq_url: required("RABBITMQ_URL")?,
      worker_id,
      concurrency: or_default("WORKER_CONCURRENCY", 1)?,
      heartbeat_interval: Duration::from_secs(or_default("HEARTBEAT_INTERVAL_SECS", 15)?),
      request_timeout: Duration::from_millis(or_default("REQUEST_TIMEOUT_MS", 10_000)?),
      dispatch_timeout: Duration::from_millis(or_default("DISPATCH_TIMEOUT_MS", 5000)?),
    };
    if config.concurrency == 0 {
      bail!("WORKER_CONCURRENCY must be at least 1");
    }
    if config.heartbeat_interval.is_zero() {
      bail!("HEARTBEAT_INTERVAL_SECS must be positive");
    }
    Ok(config)
  }
}

/// The dashboard only reads, so it needs just the two connection strings.
#[derive(Debug, Clone)]
pub struct DashboardConfig {
  pub database_url: String,
  pub rabbitmq_url: String,
}

impl DashboardConfig {
  pub fn from_env() -> anyhow::Result<Self> {
    Ok(Self {
      database_url: required("DATABASE_URL")?,
      rabbitmq_url: required("RABBITMQ_URL")?,
    })
  }
}
