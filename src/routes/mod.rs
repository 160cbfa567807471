use std::convert::Infallible;

use serde_json::json;
use tracing::error;
use warp::Filter;
use warp::http::StatusCode;

use crate::error::TaskError;
use crate::service::TaskService;

pub mod problems;
pub mod sse;
pub mod tasks;

pub fn routes(service: TaskService) -> impl Filter<Extract = impl warp::Reply, Error = Infallible> + Clone {
  tasks::task_routes(service.clone())
    .or(problems::problem_routes(service.clone()))
    .or(sse::sse_routes(service))
    .recover(handle_rejection)
}

pub(crate) fn with_service(
  service: TaskService,
) -> impl Filter<Extract = (TaskService,), Error = Infallible> + Clone {
  warp::any().map(move || service.clone())
}

/// A facade error carried through warp's rejection path.
#[derive(Debug)]
pub struct ApiError(pub TaskError);

impl warp::reject::Reject for ApiError {}

pub(crate) fn reject(err: TaskError) -> warp::Rejection {
  warp::reject::custom(ApiError(err))
}

fn status_for(err: &TaskError) -> StatusCode {
  match err {
    TaskError::NotFound { .. } | TaskError::ItemNotFound { .. } => StatusCode::NOT_FOUND,
    TaskError::Conflict { .. } => StatusCode::CONFLICT,
    TaskError::QueueSaturated { .. } => StatusCode::TOO_MANY_REQUESTS,
    _ => StatusCode::INTERNAL_SERVER_ERROR,
  }
}

async fn handle_rejection(err: warp::Rejection) -> Result<impl warp::Reply, Infallible> {
  let (status, message) = if let Some(ApiError(e)) = err.find::<ApiError>() {
    let status = status_for(e);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
      error!(error = %e, "request failed");
    }
    (status, e.to_string())
  } else if err.is_not_found() {
    (StatusCode::NOT_FOUND, "route not found".to_owned())
  } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
    (StatusCode::BAD_REQUEST, e.to_string())
  } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
    (StatusCode::BAD_REQUEST, e.to_string())
  } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_owned())
  } else {
    error!(rejection = ?err, "unhandled rejection");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_owned())
  };

  Ok(warp::reply::with_status(warp::reply::json(&json!({ "error": message })), status))
}
