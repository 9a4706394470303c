use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::{wrappers::IntervalStream, StreamExt};
use tracing::warn;
use uuid::Uuid;
use warp::sse::Event;
use warp::{Filter, Rejection, Reply};
use crate::error::CoreError;
use crate::models::TaskStatus;
use crate::routes::with_store;
use crate::task_store::TaskStore;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

struct Watch {
  store: Arc<TaskStore>,
  id: Uuid,
  ticks: IntervalStream,
  last: Option<TaskStatus>,
  done: bool,
}

pub fn sse_route(store: Arc<TaskStore>) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("api" / "tasks" / Uuid / "events")
    .and(warp::get())
    .and(with_store(store))
    .and_then(handle_sse)
}

/// One `status` event per observed change. The stream ends after a terminal status or
/// when the task is deleted.
async fn handle_sse(id: Uuid, store: Arc<TaskStore>) -> Result<impl Reply, Rejection> {
  store.get(id).await.map_err(warp::reject::custom)?;

  let watch = Watch {
    store,
    id,
    ticks: IntervalStream::new(tokio::time::interval(POLL_INTERVAL)),
    last: None,
    done: false,
  };

  let stream = futures::stream::unfold(watch, |mut watch| async move {
    if watch.done {
      return None;
    }
    while watch.ticks.next().await.is_some() {
      match watch.store.get(watch.id).await {
        Ok(task) if Some(task.status) == watch.last => continue,
        Ok(task) => {
          watch.last = Some(task.status);
          watch.done = task.status.is_terminal();
          let event = Event::default().event("status").data(
            json!({
              "taskId": task.id,
              "status": task.status,
              "retryCount": task.retry_count,
              "workerId": task.worker_id,
              "errorMessage": task.error_message,
            })
            .to_string(),
          );
          return Some((Ok::<Event, Infallible>(event), watch));
        }
        Err(CoreError::NotFound { .. }) => {
          watch.done = true;
          let event = Event::default().event("deleted").data(watch.id.to_string());
          return Some((Ok(event), watch));
        }
        Err(e) => warn!("Error fetching task status for {}: {}", watch.id, e),
      }
    }
    None
  });

  Ok(warp::sse::reply(warp::sse::keep_alive().stream(stream)))
}
