use std::sync::Arc;
use warp::{Filter, Rejection, Reply};
use crate::routes::with_store;
use crate::task_store::TaskStore;

pub fn statistics_routes(store: Arc<TaskStore>) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  let overall = warp::path!("api" / "statistics")
    .and(warp::get())
    .and(with_store(store.clone()))
    .and_then(handle_statistics);

  let per_worker = warp::path!("api" / "statistics" / "worker" / String)
    .and(warp::get())
    .and(with_store(store))
    .and_then(handle_worker_statistics);

  overall.or(per_worker)
}

async fn handle_statistics(store: Arc<TaskStore>) -> Result<impl Reply, Rejection> {
  let statistics = store.statistics().await.map_err(warp::reject::custom)?;
  Ok(warp::reply::json(&statistics))
}

async fn handle_worker_statistics(worker_id: String, store: Arc<TaskStore>) -> Result<impl Reply, Rejection> {
  let statistics = store.worker_statistics(&worker_id).await.map_err(warp::reject::custom)?;
  Ok(warp::reply::json(&statistics))
}

#[cfg(test)]
mod tests {
  use crate::models::NewTask;
  use crate::routes::{handle_rejection, routes, test_support};
  use serde_json::Value;
  use warp::Filter;

  #[tokio::test]
  async fn statistics_count_queued_as_pending() {
    let store = test_support::store(5);
    for _ in 0..2 {
      store
        .submit("c", NewTask { task_type: "X".into(), payload: "{}".into(), priority: None, max_retries: None })
        .await
        .unwrap();
    }
    let api = routes(store).recover(handle_rejection);
    let response = warp::test::request().path("/api/statistics").reply(&api).await;
    let body: Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["totalTasks"], 2);
    assert_eq!(body["pendingTasks"], 2);
    assert_eq!(body["statusCounts"]["QUEUED"], 2);
  }
}
