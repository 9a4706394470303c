use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lapin::{
  options::{BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions},
  types::{AMQPValue, FieldTable, LongString, ShortString},
  BasicProperties, Channel, Connection, ConnectionProperties,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{info, warn};
use uuid::Uuid;
use crate::error::{CoreError, Result};

pub const TASK_QUEUE: &str = "task_queue";
pub const DEAD_LETTER_QUEUE: &str = "task_queue.dlq";

static MAX_RETRIES: usize = 5;
static DELAY: u64 = 50;

/// Everything a worker needs to run a task without asking the store first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
  pub task_id: Uuid,
  pub task_type: String,
  pub payload: String,
  pub priority: u8,
}

impl TaskMessage {
  pub fn to_bytes(&self) -> Result<Vec<u8>> {
    serde_json::to_vec(self).map_err(|e| CoreError::Validation(format!("Unserializable task message: {}", e)))
  }

  pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, serde_json::Error> {
    serde_json::from_slice(bytes)
  }
}

/// A message that will not be retried. Kept verbatim for operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
  pub reason: String,
  pub original: String,
  pub dead_lettered_at: DateTime<Utc>,
}

#[async_trait]
pub trait DispatchChannel: Send + Sync {
  /// Durable hand-off of one task descriptor. Any failure here is a `TransientDelivery`.
  async fn publish(&self, message: &TaskMessage) -> Result<()>;

  /// Divert a message that cannot be routed. Never replayed automatically.
  async fn dead_letter(&self, original: &[u8], reason: &str) -> Result<()>;
}

fn backoff() -> impl Iterator<Item = Duration> {
  ExponentialBackoff::from_millis(2).factor(DELAY).map(jitter).take(MAX_RETRIES)
}

pub async fn create_rabbit_channel(rabbitmq_url: &str) -> anyhow::Result<Channel> {
  let conn = Retry::spawn(backoff(), || {
    Connection::connect(rabbitmq_url, ConnectionProperties::default())
  })
    .await?;
  let channel = conn.create_channel().await?;
  channel.confirm_select(ConfirmSelectOptions::default()).await?;
  info!("RabbitMQ channel created");
  Ok(channel)
}

/// Main queue dead-letters into the DLQ on reject/expiry, DLQ is plain durable storage.
pub async fn declare_topology(channel: &Channel) -> anyhow::Result<()> {
  let durable = QueueDeclareOptions { durable: true, ..Default::default() };

  channel
    .queue_declare(DEAD_LETTER_QUEUE, durable, FieldTable::default())
    .await?;

  let mut args = FieldTable::default();
  args.insert(ShortString::from("x-dead-letter-exchange"), AMQPValue::LongString(LongString::from("")));
  args.insert(
    ShortString::from("x-dead-letter-routing-key"),
    AMQPValue::LongString(LongString::from(DEAD_LETTER_QUEUE)),
  );
  channel.queue_declare(TASK_QUEUE, durable, args).await?;
  info!("Declared {} and {}", TASK_QUEUE, DEAD_LETTER_QUEUE);
  Ok(())
}

pub async fn publish_message(channel: &Channel, queue: &str, payload: &[u8], properties: BasicProperties) -> anyhow::Result<()> {
  Retry::spawn(backoff(), || async {
    let confirmation = channel
      .basic_publish("", queue, BasicPublishOptions::default(), payload, properties.clone())
      .await?
      .await?;
    if confirmation.is_nack() {
      anyhow::bail!("broker refused message for {}", queue);
    }
    Ok::<(), anyhow::Error>(())
  })
    .await
}

fn persistent_json() -> BasicProperties {
  BasicProperties::default()
    .with_delivery_mode(2)
    .with_content_type(ShortString::from("application/json"))
}

#[derive(Clone)]
pub struct RabbitDispatch {
  channel: Channel,
  timeout: Duration,
}

impl RabbitDispatch {
  pub fn new(channel: Channel, timeout: Duration) -> Self {
    Self { channel, timeout }
  }
}

#[async_trait]
impl DispatchChannel for RabbitDispatch {
  async fn publish(&self, message: &TaskMessage) -> Result<()> {
    let bytes = message.to_bytes()?;
    let properties = persistent_json()
      .with_priority(message.priority)
      .with_message_id(ShortString::from(message.task_id.to_string()));
    match tokio::time::timeout(self.timeout, publish_message(&self.channel, TASK_QUEUE, &bytes, properties)).await {
      Ok(Ok(())) => Ok(()),
      Ok(Err(e)) => Err(CoreError::TransientDelivery(e.to_string())),
      Err(_) => Err(CoreError::TransientDelivery(format!("publish timed out after {:?}", self.timeout))),
    }
  }

  async fn dead_letter(&self, original: &[u8], reason: &str) -> Result<()> {
    let entry = DeadLetter {
      reason: reason.to_string(),
      original: String::from_utf8_lossy(original).into_owned(),
      dead_lettered_at: Utc::now(),
    };
    let bytes = serde_json::to_vec(&entry).map_err(|e| CoreError::TransientDelivery(e.to_string()))?;
    warn!("Dead-lettering message: {}", reason);
    match tokio::time::timeout(self.timeout, publish_message(&self.channel, DEAD_LETTER_QUEUE, &bytes, persistent_json())).await {
      Ok(Ok(())) => Ok(()),
      Ok(Err(e)) => Err(CoreError::TransientDelivery(e.to_string())),
      Err(_) => Err(CoreError::TransientDelivery("dead-letter publish timed out".into())),
    }
  }
}

/// In-process channel with the same contract. Used by tests and single-process setups.
#[derive(Default)]
pub struct MemoryChannel {
  queue: Mutex<VecDeque<TaskMessage>>,
  dead_letters: Mutex<Vec<DeadLetter>>,
  unreachable: AtomicBool,
}

impl MemoryChannel {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_unreachable(&self, unreachable: bool) {
    self.unreachable.store(unreachable, Ordering::SeqCst);
  }

  pub async fn pop(&self) -> Option<TaskMessage> {
    self.queue.lock().await.pop_front()
  }

  pub async fn len(&self) -> usize {
    self.queue.lock().await.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.queue.lock().await.is_empty()
  }

  pub async fn dead_letters(&self) -> Vec<DeadLetter> {
    self.dead_letters.lock().await.clone()
  }
}

#[async_trait]
impl DispatchChannel for MemoryChannel {
  async fn publish(&self, message: &TaskMessage) -> Result<()> {
    if self.unreachable.load(Ordering::SeqCst) {
      return Err(CoreError::TransientDelivery("channel unreachable".into()));
    }
    self.queue.lock().await.push_back(message.clone());
    Ok(())
  }

  async fn dead_letter(&self, original: &[u8], reason: &str) -> Result<()> {
    self.dead_letters.lock().await.push(DeadLetter {
      reason: reason.to_string(),
      original: String::from_utf8_lossy(original).into_owned(),
      dead_lettered_at: Utc::now(),
    });
    Ok(())
  }
}
