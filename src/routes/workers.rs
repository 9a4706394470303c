use std::sync::Arc;
use warp::{Filter, Rejection, Reply};
use crate::models::Heartbeat;
use crate::routes::with_store;
use crate::task_store::TaskStore;

pub fn worker_routes(store: Arc<TaskStore>) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  let heartbeat = warp::path!("api" / "workers" / "heartbeat")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_store(store.clone()))
    .and_then(handle_heartbeat);

  let list = warp::path!("api" / "workers")
    .and(warp::get())
    .and(with_store(store.clone()))
    .and_then(handle_list);

  let get = warp::path!("api" / "workers" / String)
    .and(warp::get())
    .and(with_store(store))
    .and_then(handle_get);

  heartbeat.or(list).or(get)
}

async fn handle_heartbeat(heartbeat: Heartbeat, store: Arc<TaskStore>) -> Result<impl Reply, Rejection> {
  let worker = store.workers().heartbeat(&heartbeat).await.map_err(warp::reject::custom)?;
  Ok(warp::reply::json(&worker))
}

async fn handle_list(store: Arc<TaskStore>) -> Result<impl Reply, Rejection> {
  let workers = store.workers().list().await.map_err(warp::reject::custom)?;
  Ok(warp::reply::json(&workers))
}

async fn handle_get(worker_id: String, store: Arc<TaskStore>) -> Result<impl Reply, Rejection> {
  let worker = store.workers().get(&worker_id).await.map_err(warp::reject::custom)?;
  Ok(warp::reply::json(&worker))
}
