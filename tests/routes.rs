mod common;

use common::{service_with, stub_service};
use serde_json::{Value, json};
use taskweave::config::Config;
use taskweave::pipeline::StubPipeline;
use taskweave::routes::routes;
use warp::http::StatusCode;

fn body_json(body: &[u8]) -> Value {
  serde_json::from_slice(body).unwrap()
}

#[tokio::test]
async fn create_then_process_in_the_foreground() {
  let api = routes(stub_service());

  let res = warp::test::request()
    .method("POST")
    .path("/tasks")
    .json(&json!({ "subject": "math", "problem_count": 2, "auto_process": false }))
    .reply(&api)
    .await;
  assert_eq!(res.status(), StatusCode::CREATED);
  let created = body_json(res.body());
  assert_eq!(created["status"], "pending");
  let id = created["id"].as_str().unwrap().to_owned();

  let res = warp::test::request()
    .method("POST")
    .path(&format!("/tasks/{id}/process?background=false"))
    .reply(&api)
    .await;
  assert_eq!(res.status(), StatusCode::OK);
  let done = body_json(res.body());
  assert_eq!(done["status"], "completed");
  assert_eq!(done["problems"].as_array().unwrap().len(), 2);

  let res = warp::test::request().path("/tasks").reply(&api).await;
  let listed = body_json(res.body());
  assert_eq!(listed["items"][0]["id"], id.as_str());

  let res = warp::test::request()
    .path(&format!("/tasks/{id}/stream?max_chars=5"))
    .reply(&api)
    .await;
  let stream = body_json(res.body());
  assert_eq!(stream["task_id"], id.as_str());
  assert_eq!(stream["text"].as_str().unwrap().chars().count(), 5);

  let res = warp::test::request().method("DELETE").path(&format!("/tasks/{id}")).reply(&api).await;
  assert_eq!(res.status(), StatusCode::OK);
  let res = warp::test::request().path(&format!("/tasks/{id}")).reply(&api).await;
  assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn errors_come_back_as_json() {
  let api = routes(stub_service());

  let res = warp::test::request().path("/tasks/missing").reply(&api).await;
  assert_eq!(res.status(), StatusCode::NOT_FOUND);
  assert!(body_json(res.body())["error"].as_str().unwrap().contains("missing"));

  let res = warp::test::request()
    .method("POST")
    .path("/tasks")
    .header("content-type", "application/json")
    .body("{not json")
    .reply(&api)
    .await;
  assert_eq!(res.status(), StatusCode::BAD_REQUEST);
  assert!(body_json(res.body())["error"].is_string());

  let res = warp::test::request().path("/nowhere").reply(&api).await;
  assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn active_tasks_cannot_be_deleted() {
  let api = routes(stub_service());
  let res = warp::test::request()
    .method("POST")
    .path("/tasks")
    .json(&json!({ "subject": "math" }))
    .reply(&api)
    .await;
  let created = body_json(res.body());
  assert_eq!(created["stage"], "queued");
  let id = created["id"].as_str().unwrap();

  let res = warp::test::request().method("DELETE").path(&format!("/tasks/{id}")).reply(&api).await;
  assert_eq!(res.status(), StatusCode::CONFLICT);

  let res = warp::test::request()
    .method("POST")
    .path(&format!("/tasks/{id}/cancel"))
    .reply(&api)
    .await;
  assert_eq!(body_json(res.body())["status"], "failed");
  let res = warp::test::request().method("DELETE").path(&format!("/tasks/{id}")).reply(&api).await;
  assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn a_full_queue_answers_too_many_requests() {
  let config = Config {
    queue_capacity: 1,
    ..Config::for_tests()
  };
  let (service, _) = service_with(config, StubPipeline::default());
  let api = routes(service);

  let first = warp::test::request()
    .method("POST")
    .path("/tasks")
    .json(&json!({ "subject": "math" }))
    .reply(&api)
    .await;
  assert_eq!(first.status(), StatusCode::CREATED);

  let second = warp::test::request()
    .method("POST")
    .path("/tasks")
    .json(&json!({ "subject": "math" }))
    .reply(&api)
    .await;
  assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn problem_routes_edit_and_list() {
  let service = stub_service();
  let task = service.create(common::payload(2), false).await.unwrap();
  service.process(&task.id, false).await.unwrap();
  let api = routes(service);

  let res = warp::test::request()
    .method("PATCH")
    .path(&format!("/tasks/{}/problems/p1", task.id))
    .json(&json!({ "user_tags": ["exam"], "knowledge_points": ["Ratios"] }))
    .reply(&api)
    .await;
  assert_eq!(res.status(), StatusCode::OK);
  let patched = body_json(res.body());
  assert_eq!(patched["problems"][0]["user_tags"], json!(["exam"]));

  let res = warp::test::request().path("/problems?subject=math&tag=Ratios").reply(&api).await;
  let items = body_json(res.body())["items"].as_array().unwrap().clone();
  assert_eq!(items.len(), 1);
  assert_eq!(items[0]["problem_id"], "p1");

  let res = warp::test::request()
    .method("POST")
    .path(&format!("/tasks/{}/problems/p9/retag", task.id))
    .reply(&api)
    .await;
  assert_eq!(res.status(), StatusCode::NOT_FOUND);

  let res = warp::test::request()
    .method("DELETE")
    .path(&format!("/tasks/{}/problems/p2", task.id))
    .reply(&api)
    .await;
  assert_eq!(body_json(res.body())["problems"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn events_for_a_finished_task_end_with_done() {
  let service = stub_service();
  let task = service.create(common::payload(1), false).await.unwrap();
  service.process(&task.id, false).await.unwrap();
  let api = routes(service);

  let res = warp::test::request().path(&format!("/tasks/{}/events", task.id)).reply(&api).await;
  assert_eq!(res.status(), StatusCode::OK);
  let body = String::from_utf8(res.body().to_vec()).unwrap();
  let progress = body.find("progress").unwrap();
  let snapshot = body.find("llm_snapshot").unwrap();
  let done = body.rfind("done").unwrap();
  assert!(progress < snapshot && snapshot < done);
}
