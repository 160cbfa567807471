use serde::{Deserialize, Serialize};
use warp::Filter;

use super::{reject, with_service};
use crate::models::{ProblemOverride, ProblemSummary, TaskId};
use crate::service::TaskService;

#[derive(Debug, Default, Deserialize)]
pub struct RetagQuery {
  #[serde(default)]
  pub force: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct LibraryQuery {
  pub subject: Option<String>,
  pub tag: Option<String>,
}

#[derive(Serialize)]
struct ProblemList {
  items: Vec<ProblemSummary>,
}

pub fn problem_routes(
  service: TaskService,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  let retry = warp::path!("tasks" / String / "problems" / String / "retry")
    .and(warp::post())
    .and(with_service(service.clone()))
    .and_then(handle_retry);

  let retag = warp::path!("tasks" / String / "problems" / String / "retag")
    .and(warp::post())
    .and(warp::query::<RetagQuery>())
    .and(with_service(service.clone()))
    .and_then(handle_retag);

  let patch = warp::path!("tasks" / String / "problems" / String)
    .and(warp::patch())
    .and(warp::body::json())
    .and(with_service(service.clone()))
    .and_then(handle_override);

  let delete = warp::path!("tasks" / String / "problems" / String)
    .and(warp::delete())
    .and(with_service(service.clone()))
    .and_then(handle_delete);

  let library = warp::path!("problems")
    .and(warp::get())
    .and(warp::query::<LibraryQuery>())
    .and(with_service(service))
    .and_then(handle_library);

  retry.or(retag).or(patch).or(delete).or(library)
}

async fn handle_retry(
  task_id: String,
  problem_id: String,
  service: TaskService,
) -> Result<impl warp::Reply, warp::Rejection> {
  let task = service.retry_item(&TaskId::from(task_id), &problem_id).await.map_err(reject)?;
  Ok(warp::reply::json(&task))
}

async fn handle_retag(
  task_id: String,
  problem_id: String,
  query: RetagQuery,
  service: TaskService,
) -> Result<impl warp::Reply, warp::Rejection> {
  let task = service
    .retag_item(&TaskId::from(task_id), &problem_id, query.force)
    .await
    .map_err(reject)?;
  Ok(warp::reply::json(&task))
}

async fn handle_override(
  task_id: String,
  problem_id: String,
  patch: ProblemOverride,
  service: TaskService,
) -> Result<impl warp::Reply, warp::Rejection> {
  let task = service
    .override_item(&TaskId::from(task_id), &problem_id, patch)
    .await
    .map_err(reject)?;
  Ok(warp::reply::json(&task))
}

async fn handle_delete(
  task_id: String,
  problem_id: String,
  service: TaskService,
) -> Result<impl warp::Reply, warp::Rejection> {
  let task = service.delete_item(&TaskId::from(task_id), &problem_id).await.map_err(reject)?;
  Ok(warp::reply::json(&task))
}

async fn handle_library(query: LibraryQuery, service: TaskService) -> Result<impl warp::Reply, warp::Rejection> {
  let items = service
    .list_items(query.subject.as_deref(), query.tag.as_deref())
    .await
    .map_err(reject)?;
  Ok(warp::reply::json(&ProblemList { items }))
}
