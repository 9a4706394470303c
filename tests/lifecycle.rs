use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use dispatchq::clock::ManualClock;
use dispatchq::error::CoreError;
use dispatchq::messaging::{DispatchChannel, MemoryChannel};
use dispatchq::models::{NewTask, TaskStatus, WorkerStatus};
use dispatchq::rate_limiter::{RateLimitPolicy, SlidingWindowLimiter};
use dispatchq::retry_scheduler::{BackoffPolicy, RetryScheduler};
use dispatchq::store::{MemoryTaskRepository, MemoryWorkerRepository};
use dispatchq::task_store::TaskStore;
use dispatchq::worker_processing::{ProcessingError, ProcessingResult, ProcessorRegistry, TaskProcessor};
use dispatchq::worker_registry::{WorkerRegistry, HEARTBEAT_TIMEOUT};
use dispatchq::worker_runtime::{Disposition, WorkerRuntime};

struct AlwaysBusy;

#[async_trait]
impl TaskProcessor for AlwaysBusy {
  fn task_type(&self) -> &'static str {
    "ALWAYS_BUSY"
  }

  async fn execute(&self, _payload: &str) -> ProcessingResult {
    Err(ProcessingError::Retryable("downstream busy".into()))
  }
}

struct Cluster {
  clock: Arc<ManualClock>,
  channel: Arc<MemoryChannel>,
  retries: Arc<RetryScheduler>,
  store: Arc<TaskStore>,
}

fn cluster(rate_limit: u32) -> Cluster {
  let clock = Arc::new(ManualClock::default());
  let channel = Arc::new(MemoryChannel::new());
  let retries = Arc::new(RetryScheduler::new(BackoffPolicy::default(), clock.clone()));
  let workers = Arc::new(WorkerRegistry::new(
    Arc::new(MemoryWorkerRepository::new()),
    clock.clone(),
    HEARTBEAT_TIMEOUT,
  ));
  let store = Arc::new(TaskStore::new(
    Arc::new(MemoryTaskRepository::new()),
    channel.clone(),
    workers,
    retries.clone(),
    Arc::new(SlidingWindowLimiter::new(RateLimitPolicy::per_minute(rate_limit), clock.clone())),
    clock.clone(),
  ));
  Cluster { clock, channel, retries, store }
}

fn worker(cluster: &Cluster, worker_id: &str) -> WorkerRuntime {
  let mut processors = ProcessorRegistry::with_builtin(Duration::ZERO);
  processors.register(AlwaysBusy);
  WorkerRuntime::new(worker_id, cluster.store.clone(), processors)
}

fn submission(task_type: &str, payload: &str, max_retries: Option<u32>) -> NewTask {
  NewTask { task_type: task_type.into(), payload: payload.into(), priority: None, max_retries }
}

async fn deliver(cluster: &Cluster, runtime: &WorkerRuntime) -> Disposition {
  let message = cluster.channel.pop().await.expect("a message was queued");
  runtime.handle(&message.to_bytes().unwrap(), false).await
}

async fn fire_due_retries(cluster: &Cluster) {
  for entry in cluster.retries.take_due().await {
    cluster.store.requeue(entry.task_id).await;
  }
}

#[tokio::test]
async fn email_task_runs_to_completion() {
  let cluster = cluster(100);
  let runtime = worker(&cluster, "W1");
  runtime.send_heartbeat().await;

  let task = cluster
    .store
    .submit("client", submission("EMAIL_SENDING", r#"{"recipient":"a@b.c","subject":"hello"}"#, None))
    .await
    .unwrap()
    .task;
  assert_eq!(task.status, TaskStatus::Queued);

  assert_eq!(deliver(&cluster, &runtime).await, Disposition::Ack);

  let done = cluster.store.get(task.id).await.unwrap();
  assert_eq!(done.status, TaskStatus::Completed);
  assert_eq!(done.worker_id.as_deref(), Some("W1"));
  assert!(done.result.is_some());
  assert!(done.completed_at.is_some());

  let w1 = cluster.store.workers().get("W1").await.unwrap();
  assert_eq!(w1.total_processed, 1);
  assert_eq!(w1.active_tasks, 0);

  let stats = cluster.store.statistics().await.unwrap();
  assert_eq!(stats.completed_tasks, 1);
  assert_eq!(stats.success_rate, 100.0);
}

#[tokio::test]
async fn retryable_failures_back_off_then_fail_permanently() {
  let cluster = cluster(100);
  let runtime = worker(&cluster, "W1");
  runtime.send_heartbeat().await;

  let task = cluster
    .store
    .submit("client", submission("ALWAYS_BUSY", "{}", Some(2)))
    .await
    .unwrap()
    .task;

  // First attempt fails: RETRYING, due one second later.
  deliver(&cluster, &runtime).await;
  let after_first = cluster.store.get(task.id).await.unwrap();
  assert_eq!(after_first.status, TaskStatus::Retrying);
  assert_eq!(after_first.retry_count, 1);
  assert!(cluster.channel.is_empty().await);

  cluster.clock.advance(chrono::Duration::milliseconds(999));
  fire_due_retries(&cluster).await;
  assert!(cluster.channel.is_empty().await);
  cluster.clock.advance(chrono::Duration::milliseconds(1));
  fire_due_retries(&cluster).await;
  assert_eq!(cluster.store.get(task.id).await.unwrap().status, TaskStatus::Queued);

  // Second attempt fails: two seconds this time.
  deliver(&cluster, &runtime).await;
  assert_eq!(cluster.store.get(task.id).await.unwrap().retry_count, 2);
  cluster.clock.advance(chrono::Duration::seconds(2));
  fire_due_retries(&cluster).await;

  // Third attempt exhausts the budget.
  deliver(&cluster, &runtime).await;
  let failed = cluster.store.get(task.id).await.unwrap();
  assert_eq!(failed.status, TaskStatus::Failed);
  assert_eq!(failed.retry_count, 2);
  assert_eq!(failed.error_message.as_deref(), Some("downstream busy"));
  assert_eq!(cluster.retries.pending().await, 0);

  let w1 = cluster.store.workers().get("W1").await.unwrap();
  assert_eq!(w1.total_failed, 1);
  assert_eq!(w1.total_processed, 0);
  assert_eq!(w1.active_tasks, 0);
}

#[tokio::test]
async fn duplicate_deliveries_are_processed_once() {
  let cluster = cluster(100);
  let task = cluster
    .store
    .submit("client", submission("DATA_ANALYSIS", r#"{"dataset":"sales","analysisType":"mean"}"#, None))
    .await
    .unwrap()
    .task;
  let raw = cluster.channel.pop().await.unwrap().to_bytes().unwrap();

  let runtimes: Vec<Arc<WorkerRuntime>> = (0..8).map(|i| Arc::new(worker(&cluster, &format!("W{}", i)))).collect();
  let handles: Vec<_> = runtimes
    .iter()
    .map(|runtime| {
      let runtime = runtime.clone();
      let raw = raw.clone();
      tokio::spawn(async move { runtime.handle(&raw, false).await })
    })
    .collect();
  for handle in handles {
    assert_eq!(handle.await.unwrap(), Disposition::Ack);
  }

  let done = cluster.store.get(task.id).await.unwrap();
  assert_eq!(done.status, TaskStatus::Completed);
  assert_eq!(cluster.store.worker_statistics(done.worker_id.as_deref().unwrap()).await.unwrap().completed_tasks, 1);
}

#[tokio::test]
async fn unroutable_type_fails_the_task_and_dead_letters_the_message() {
  let cluster = cluster(100);
  let runtime = worker(&cluster, "W1");
  let task = cluster
    .store
    .submit("client", submission("VIDEO_TRANSCODE", "{}", None))
    .await
    .unwrap()
    .task;

  let message = cluster.channel.pop().await.unwrap();
  let raw = message.to_bytes().unwrap();
  match runtime.handle(&raw, false).await {
    Disposition::DeadLetter(reason) => cluster.channel.dead_letter(&raw, &reason).await.unwrap(),
    other => panic!("expected dead letter, got {other:?}"),
  }

  let failed = cluster.store.get(task.id).await.unwrap();
  assert_eq!(failed.status, TaskStatus::Failed);
  assert_eq!(failed.retry_count, 0);
  assert_eq!(cluster.channel.dead_letters().await.len(), 1);
}

#[tokio::test]
async fn unreachable_channel_fails_the_task_without_consuming_retries() {
  let cluster = cluster(100);
  cluster.channel.set_unreachable(true);
  let task = cluster
    .store
    .submit("client", submission("EMAIL_SENDING", "{}", None))
    .await
    .unwrap()
    .task;
  assert_eq!(task.status, TaskStatus::Failed);
  assert_eq!(task.retry_count, 0);
  assert!(task.error_message.unwrap().starts_with("Failed to queue"));
}

#[tokio::test]
async fn silent_worker_goes_offline_and_comes_back() {
  let cluster = cluster(100);
  let runtime = worker(&cluster, "W1");
  runtime.send_heartbeat().await;
  assert_eq!(cluster.store.statistics().await.unwrap().active_workers, 1);

  cluster.clock.advance(chrono::Duration::seconds(61));
  assert_eq!(cluster.store.workers().sweep().await.unwrap(), vec!["W1".to_string()]);
  assert_eq!(cluster.store.workers().get("W1").await.unwrap().status, WorkerStatus::Offline);
  assert_eq!(cluster.store.statistics().await.unwrap().active_workers, 0);

  runtime.send_heartbeat().await;
  assert_eq!(cluster.store.workers().get("W1").await.unwrap().status, WorkerStatus::Idle);
}

#[tokio::test]
async fn rate_limit_rejects_before_anything_is_stored() {
  let cluster = cluster(2);
  for _ in 0..2 {
    cluster.store.submit("burst", submission("EMAIL_SENDING", "{}", None)).await.unwrap();
  }
  let err = cluster.store.submit("burst", submission("EMAIL_SENDING", "{}", None)).await.unwrap_err();
  assert!(matches!(err, CoreError::RateLimitExceeded { .. }));
  assert_eq!(cluster.store.statistics().await.unwrap().total_tasks, 2);
  assert_eq!(cluster.channel.len().await, 2);

  assert!(cluster.store.submit("other", submission("EMAIL_SENDING", "{}", None)).await.is_ok());
}
