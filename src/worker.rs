use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions};
use lapin::types::FieldTable;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use dispatchq::{
  api_client::HttpCoreClient,
  config::WorkerConfig,
  messaging::{create_rabbit_channel, declare_topology, DispatchChannel, RabbitDispatch, TASK_QUEUE},
  worker_processing::ProcessorRegistry,
  worker_runtime::{Disposition, ResourceSampler, WorkerRuntime},
};

const SIMULATED_WORK: Duration = Duration::from_secs(2);

async fn settle(delivery: Delivery, disposition: Disposition, dead_letters: &RabbitDispatch) {
  let settled = match disposition {
    Disposition::Ack => delivery.ack(BasicAckOptions::default()).await,
    Disposition::Requeue => delivery.nack(BasicNackOptions { requeue: true, ..Default::default() }).await,
    Disposition::DeadLetter(reason) => match dead_letters.dead_letter(&delivery.data, &reason).await {
      Ok(()) => delivery.ack(BasicAckOptions::default()).await,
      Err(e) => {
        // Rejecting without requeue still routes the raw message to the DLQ.
        warn!("Could not publish dead letter ({}), rejecting instead", e);
        delivery.nack(BasicNackOptions { requeue: false, ..Default::default() }).await
      }
    },
  };
  if let Err(e) = settled {
    error!("Failed to settle delivery: {:?}", e);
  }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let config = WorkerConfig::from_env()?;
  let rabbit_channel = create_rabbit_channel(&config.rabbitmq_url).await?;
  declare_topology(&rabbit_channel).await?;
  rabbit_channel
    .basic_qos(config.concurrency, BasicQosOptions::default())
    .await?;

  let client = Arc::new(HttpCoreClient::new(&config.api_url, config.request_timeout)?);
  let runtime = Arc::new(
    WorkerRuntime::new(config.worker_id.clone(), client, ProcessorRegistry::with_builtin(SIMULATED_WORK))
      .with_sampler(ResourceSampler::new()),
  );
  let dead_letters = Arc::new(RabbitDispatch::new(rabbit_channel.clone(), config.dispatch_timeout));

  tokio::spawn(runtime.clone().run_heartbeats(config.heartbeat_interval));

  let mut consumer = rabbit_channel
    .basic_consume(TASK_QUEUE, &config.worker_id, BasicConsumeOptions::default(), FieldTable::default())
    .await?;
  info!("Worker {} consuming {} with concurrency {}", config.worker_id, TASK_QUEUE, config.concurrency);

  let semaphore = Arc::new(Semaphore::new(config.concurrency as usize));
  while let Some(delivery) = consumer.next().await {
    let delivery = match delivery {
      Ok(delivery) => delivery,
      Err(e) => {
        error!("Consumer error: {:?}", e);
        continue;
      }
    };
    let permit = semaphore.clone().acquire_owned().await?;
    let runtime = runtime.clone();
    let dead_letters = dead_letters.clone();
    tokio::spawn(async move {
      let disposition = runtime.handle(&delivery.data, delivery.redelivered).await;
      settle(delivery, disposition, &dead_letters).await;
      drop(permit);
    });
  }

  warn!("Consumer stream ended");
  Ok(())
}
