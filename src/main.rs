use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use warp::Filter;
use dispatchq::{
  clock::{Clock, SystemClock},
  config::Config,
  database::setup_database,
  messaging::{create_rabbit_channel, declare_topology, RabbitDispatch},
  rate_limiter::{RateLimitPolicy, SlidingWindowLimiter},
  retry_scheduler::{BackoffPolicy, RetryScheduler},
  routes::{handle_rejection, routes},
  store::{PgTaskRepository, PgWorkerRepository},
  task_store::TaskStore,
  worker_registry::WorkerRegistry,
};

const RETRY_TICK: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let config = Config::from_env()?;
  let db_pool = setup_database(&config.database_url).await?;
  let rabbit_channel = create_rabbit_channel(&config.rabbitmq_url).await?;
  declare_topology(&rabbit_channel).await?;

  let clock: Arc<dyn Clock> = Arc::new(SystemClock);
  let workers = Arc::new(WorkerRegistry::new(
    Arc::new(PgWorkerRepository::new(db_pool.clone())),
    clock.clone(),
    config.heartbeat_timeout,
  ));
  let retries = Arc::new(RetryScheduler::new(
    BackoffPolicy { base_delay: config.retry_base_delay, jitter: config.retry_jitter },
    clock.clone(),
  ));
  let limiter = Arc::new(SlidingWindowLimiter::new(
    RateLimitPolicy::per_minute(config.rate_limit_per_minute),
    clock.clone(),
  ));
  let store = Arc::new(TaskStore::new(
    Arc::new(PgTaskRepository::new(db_pool)),
    Arc::new(RabbitDispatch::new(rabbit_channel, config.dispatch_timeout)),
    workers.clone(),
    retries.clone(),
    limiter.clone(),
    clock,
  ));

  store.recover_pending().await?;
  store.recover_retries().await?;

  tokio::spawn(workers.run_sweeper(config.sweep_interval));
  tokio::spawn(limiter.clone().run_purge(limiter.policy().window));
  let requeue_store = store.clone();
  tokio::spawn(retries.run(RETRY_TICK, move |id| {
    let store = requeue_store.clone();
    async move { store.requeue(id).await }
  }));

  let api = routes(store)
    .recover(handle_rejection)
    .with(warp::trace::request());

  info!("Listening on port {}", config.server_port);
  warp::serve(api)
    .run(([0, 0, 0, 0], config.server_port))
    .await;
  Ok(())
}
