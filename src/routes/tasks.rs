use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};
use crate::error::CoreError;
use crate::models::{NewTask, TaskStatus};
use crate::routes::{caller, with_store};
use crate::task_store::TaskStore;

/// Payload may be sent as a JSON string or as an inline JSON value. It is required;
/// absent and `null` are both rejected.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
  #[serde(rename = "type")]
  pub task_type: String,
  pub payload: Option<Value>,
  pub priority: Option<u8>,
  pub max_retries: Option<u32>,
}

impl TryFrom<SubmitRequest> for NewTask {
  type Error = CoreError;

  fn try_from(request: SubmitRequest) -> Result<Self, Self::Error> {
    let payload = match request.payload {
      None | Some(Value::Null) => return Err(CoreError::Validation("payload is required".into())),
      Some(value) => json_text(value),
    };
    Ok(NewTask {
      task_type: request.task_type,
      payload,
      priority: request.priority,
      max_retries: request.max_retries,
    })
  }
}

#[derive(Deserialize)]
pub struct ListQuery {
  pub status: Option<String>,
  pub page: Option<u32>,
  pub size: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimBody {
  pub worker_id: String,
}

#[derive(Deserialize)]
pub struct CompleteBody {
  pub result: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailBody {
  pub error_message: String,
  #[serde(default = "default_should_retry")]
  pub should_retry: bool,
}

fn default_should_retry() -> bool {
  true
}

fn json_text(value: Value) -> String {
  match value {
    Value::String(raw) => raw,
    other => other.to_string(),
  }
}

pub fn task_routes(store: Arc<TaskStore>) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  let submit = warp::path!("api" / "tasks")
    .and(warp::post())
    .and(caller())
    .and(warp::body::json())
    .and(with_store(store.clone()))
    .and_then(handle_submit);

  let list = warp::path!("api" / "tasks")
    .and(warp::get())
    .and(warp::query::<ListQuery>())
    .and(with_store(store.clone()))
    .and_then(handle_list);

  let get = warp::path!("api" / "tasks" / Uuid)
    .and(warp::get())
    .and(with_store(store.clone()))
    .and_then(handle_get);

  let delete = warp::path!("api" / "tasks" / Uuid)
    .and(warp::delete())
    .and(with_store(store.clone()))
    .and_then(handle_delete);

  let processing = warp::path!("api" / "tasks" / Uuid / "processing")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_store(store.clone()))
    .and_then(handle_processing);

  let completed = warp::path!("api" / "tasks" / Uuid / "completed")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_store(store.clone()))
    .and_then(handle_completed);

  let failed = warp::path!("api" / "tasks" / Uuid / "failed")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_store(store))
    .and_then(handle_failed);

  submit.or(list).or(get).or(delete).or(processing).or(completed).or(failed)
}

async fn handle_submit(caller: String, request: SubmitRequest, store: Arc<TaskStore>) -> Result<impl Reply, Rejection> {
  let submission = NewTask::try_from(request).map_err(warp::reject::custom)?;
  let submitted = store.submit(&caller, submission).await.map_err(warp::reject::custom)?;
  let reply = warp::reply::with_status(warp::reply::json(&submitted.task), StatusCode::CREATED);
  Ok(warp::reply::with_header(reply, "X-RateLimit-Remaining", submitted.remaining.to_string()))
}

async fn handle_list(query: ListQuery, store: Arc<TaskStore>) -> Result<impl Reply, Rejection> {
  let status = query
    .status
    .as_deref()
    .map(str::parse::<TaskStatus>)
    .transpose()
    .map_err(warp::reject::custom)?;
  let page = store
    .list(status, query.page.unwrap_or(0), query.size.unwrap_or(20))
    .await
    .map_err(warp::reject::custom)?;
  Ok(warp::reply::json(&page))
}

async fn handle_get(id: Uuid, store: Arc<TaskStore>) -> Result<impl Reply, Rejection> {
  let task = store.get(id).await.map_err(warp::reject::custom)?;
  Ok(warp::reply::json(&task))
}

async fn handle_delete(id: Uuid, store: Arc<TaskStore>) -> Result<impl Reply, Rejection> {
  store.delete(id).await.map_err(warp::reject::custom)?;
  Ok(StatusCode::NO_CONTENT)
}

async fn handle_processing(id: Uuid, body: ClaimBody, store: Arc<TaskStore>) -> Result<impl Reply, Rejection> {
  let task = store.claim(id, &body.worker_id).await.map_err(warp::reject::custom)?;
  Ok(warp::reply::json(&task))
}

async fn handle_completed(id: Uuid, body: CompleteBody, store: Arc<TaskStore>) -> Result<impl Reply, Rejection> {
  let task = store.complete(id, json_text(body.result)).await.map_err(warp::reject::custom)?;
  Ok(warp::reply::json(&task))
}

async fn handle_failed(id: Uuid, body: FailBody, store: Arc<TaskStore>) -> Result<impl Reply, Rejection> {
  if body.error_message.trim().is_empty() {
    return Err(warp::reject::custom(CoreError::Validation("errorMessage must not be empty".into())));
  }
  let task = store
    .fail(id, &body.error_message, body.should_retry)
    .await
    .map_err(warp::reject::custom)?;
  Ok(warp::reply::json(&task))
}
