use serde::{Deserialize, Serialize};
use tracing::info;
use warp::Filter;
use warp::http::StatusCode;

use super::{reject, with_service};
use crate::models::{TaskFilter, TaskId, TaskPayload, TaskSummary};
use crate::service::TaskService;

fn default_true() -> bool {
  true
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
  #[serde(flatten)]
  pub payload: TaskPayload,
  #[serde(default = "default_true")]
  pub auto_process: bool,
}

#[derive(Debug, Deserialize)]
pub struct RunQuery {
  #[serde(default = "default_true")]
  pub background: bool,
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
  pub max_chars: Option<usize>,
}

#[derive(Serialize)]
struct TaskList {
  items: Vec<TaskSummary>,
}

#[derive(Serialize)]
struct StreamText {
  task_id: TaskId,
  text: String,
}

pub fn task_routes(
  service: TaskService,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  let create = warp::path!("tasks")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_service(service.clone()))
    .and_then(handle_create);

  let list = warp::path!("tasks")
    .and(warp::get())
    .and(warp::query::<TaskFilter>())
    .and(with_service(service.clone()))
    .and_then(handle_list);

  let get = warp::path!("tasks" / String)
    .and(warp::get())
    .and(with_service(service.clone()))
    .and_then(handle_get);

  let delete = warp::path!("tasks" / String)
    .and(warp::delete())
    .and(with_service(service.clone()))
    .and_then(handle_delete);

  let process = warp::path!("tasks" / String / "process")
    .and(warp::post())
    .and(warp::query::<RunQuery>())
    .and(with_service(service.clone()))
    .and_then(handle_process);

  let retry = warp::path!("tasks" / String / "retry")
    .and(warp::post())
    .and(warp::query::<RunQuery>())
    .and(with_service(service.clone()))
    .and_then(handle_retry);

  let cancel = warp::path!("tasks" / String / "cancel")
    .and(warp::post())
    .and(with_service(service.clone()))
    .and_then(handle_cancel);

  let stream = warp::path!("tasks" / String / "stream")
    .and(warp::get())
    .and(warp::query::<StreamQuery>())
    .and(with_service(service))
    .and_then(handle_stream);

  create
    .or(list)
    .or(get)
    .or(delete)
    .or(process)
    .or(retry)
    .or(cancel)
    .or(stream)
}

async fn handle_create(req: CreateTaskRequest, service: TaskService) -> Result<impl warp::Reply, warp::Rejection> {
  let task = service.create(req.payload, req.auto_process).await.map_err(reject)?;
  info!(task_id = %task.id, "task submitted");
  Ok(warp::reply::with_status(warp::reply::json(&task), StatusCode::CREATED))
}

async fn handle_list(filter: TaskFilter, service: TaskService) -> Result<impl warp::Reply, warp::Rejection> {
  let items = service.list(&filter).await.map_err(reject)?;
  Ok(warp::reply::json(&TaskList { items }))
}

async fn handle_get(task_id: String, service: TaskService) -> Result<impl warp::Reply, warp::Rejection> {
  let task = service.get(&TaskId::from(task_id)).await.map_err(reject)?;
  Ok(warp::reply::json(&task))
}

async fn handle_delete(task_id: String, service: TaskService) -> Result<impl warp::Reply, warp::Rejection> {
  let task = service.delete(&TaskId::from(task_id)).await.map_err(reject)?;
  Ok(warp::reply::json(&task))
}

async fn handle_process(
  task_id: String,
  query: RunQuery,
  service: TaskService,
) -> Result<impl warp::Reply, warp::Rejection> {
  let task = service.process(&TaskId::from(task_id), query.background).await.map_err(reject)?;
  Ok(warp::reply::json(&task))
}

async fn handle_retry(
  task_id: String,
  query: RunQuery,
  service: TaskService,
) -> Result<impl warp::Reply, warp::Rejection> {
  let task = service.retry(&TaskId::from(task_id), query.background).await.map_err(reject)?;
  Ok(warp::reply::json(&task))
}

async fn handle_cancel(task_id: String, service: TaskService) -> Result<impl warp::Reply, warp::Rejection> {
  let task = service.cancel(&TaskId::from(task_id)).await.map_err(reject)?;
  Ok(warp::reply::json(&task))
}

async fn handle_stream(
  task_id: String,
  query: StreamQuery,
  service: TaskService,
) -> Result<impl warp::Reply, warp::Rejection> {
  let task_id = TaskId::from(task_id);
  let max_chars = query.max_chars.unwrap_or(service.config().stream_cache_max_chars);
  let text = service.get_stream_snapshot(&task_id, max_chars).await.map_err(reject)?;
  Ok(warp::reply::json(&StreamText { task_id, text }))
}
