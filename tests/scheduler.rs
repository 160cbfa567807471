mod common;

use std::time::Duration;

use chrono::Utc;
use common::{FailingPipeline, payload, service_with, stub_service, wait_for_status, wait_until_idle};
use futures::future::join_all;
use taskweave::config::Config;
use taskweave::error::TaskError;
use taskweave::lifecycle::{CANCELLED_REASON, STALE_REASON, TaskStatus};
use taskweave::models::{TaskFilter, TaskPayload, TaskRecord};
use taskweave::pipeline::StubPipeline;
use taskweave::store::TaskStore;
use taskweave::worker_scheduler::Enqueued;
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn concurrent_enqueues_dispatch_once() {
  let service = stub_service();
  let task = service.create(payload(2), false).await.unwrap();

  let results = join_all((0..8).map(|_| service.scheduler().enqueue(&task.id))).await;
  let queued = results.iter().filter(|r| matches!(r, Ok(Enqueued::Queued))).count();
  let skipped = results.iter().filter(|r| matches!(r, Ok(Enqueued::AlreadyInFlight))).count();
  assert_eq!((queued, skipped), (1, 7));
  assert_eq!(service.scheduler().queue_len(), 1);

  service.scheduler().start_workers();
  let done = wait_for_status(&service, &task.id, TaskStatus::Completed).await;
  assert_eq!(done.problems.len(), 2);
  wait_until_idle(&service).await;
  assert_eq!(service.scheduler().queue_len(), 0);
}

#[tokio::test]
async fn saturated_queue_rejects_without_leaking_claims() {
  let config = Config {
    queue_capacity: 1,
    ..Config::for_tests()
  };
  let (service, _) = service_with(config, StubPipeline::default());
  let first = service.create(payload(1), false).await.unwrap();
  let second = service.create(payload(1), false).await.unwrap();

  assert_eq!(assert_ok!(service.scheduler().enqueue(&first.id).await), Enqueued::Queued);
  let err = assert_err!(service.scheduler().enqueue(&second.id).await);
  assert!(matches!(err, TaskError::QueueSaturated { capacity: 1 }));
  assert!(!service.scheduler().in_flight().contains(&second.id));
  assert_eq!(service.get(&second.id).await.unwrap().status, TaskStatus::Pending);

  service.scheduler().start_workers();
  wait_for_status(&service, &first.id, TaskStatus::Completed).await;
  wait_until_idle(&service).await;

  assert_ok!(service.scheduler().enqueue(&second.id).await);
  wait_for_status(&service, &second.id, TaskStatus::Completed).await;
}

#[tokio::test]
async fn create_reports_backpressure() {
  let config = Config {
    queue_capacity: 1,
    ..Config::for_tests()
  };
  let (service, _) = service_with(config, StubPipeline::default());
  assert_ok!(service.create(payload(1), true).await);
  let err = assert_err!(service.create(payload(1), true).await);
  assert!(matches!(err, TaskError::QueueSaturated { .. }));
}

#[tokio::test]
async fn orphaned_processing_tasks_are_reclaimed_on_list() {
  let (service, store) = service_with(Config::for_tests(), StubPipeline::default());

  let mut orphan = TaskRecord::new(TaskPayload::default());
  orphan.status = TaskStatus::Processing;
  orphan.updated_at = Utc::now() - chrono::Duration::minutes(20);
  store.insert(orphan.clone()).await.unwrap();

  let mut owned = TaskRecord::new(TaskPayload::default());
  owned.status = TaskStatus::Processing;
  owned.updated_at = Utc::now() - chrono::Duration::hours(3);
  store.insert(owned.clone()).await.unwrap();
  let _claim = service.scheduler().in_flight().try_claim(&owned.id).unwrap();

  let mut recent = TaskRecord::new(TaskPayload::default());
  recent.status = TaskStatus::Processing;
  store.insert(recent.clone()).await.unwrap();

  let listed = service.list(&TaskFilter::default()).await.unwrap();
  assert_eq!(listed.len(), 3);

  let orphan = service.get(&orphan.id).await.unwrap();
  assert_eq!(orphan.status, TaskStatus::Failed);
  assert_eq!(orphan.last_error.as_deref(), Some(STALE_REASON));
  assert_eq!(service.get(&owned.id).await.unwrap().status, TaskStatus::Processing);
  assert_eq!(service.get(&recent.id).await.unwrap().status, TaskStatus::Processing);

  let active = TaskFilter {
    active_only: true,
    ..TaskFilter::default()
  };
  assert_eq!(service.list(&active).await.unwrap().len(), 2);
}

#[tokio::test]
async fn cancel_is_idempotent() {
  let service = stub_service();
  let task = service.create(payload(1), false).await.unwrap();

  let first = service.cancel(&task.id).await.unwrap();
  assert_eq!(first.status, TaskStatus::Failed);
  assert_eq!(first.last_error.as_deref(), Some(CANCELLED_REASON));
  assert_eq!(first.stage.as_deref(), Some("cancelled"));

  let second = service.cancel(&task.id).await.unwrap();
  assert_eq!(second, first);
}

#[tokio::test]
async fn cancelled_queue_entries_never_run() {
  let service = stub_service();
  let task = service.create(payload(1), true).await.unwrap();
  service.cancel(&task.id).await.unwrap();

  service.scheduler().start_workers();
  wait_until_idle(&service).await;

  let record = service.get(&task.id).await.unwrap();
  assert_eq!(record.status, TaskStatus::Failed);
  assert_eq!(record.last_error.as_deref(), Some(CANCELLED_REASON));
  assert!(record.problems.is_empty());
  assert_eq!(service.get_stream_snapshot(&task.id, 0).await.unwrap(), "");
}

#[tokio::test]
async fn cancel_stops_a_running_task_and_retry_restarts_it() {
  let pipeline = StubPipeline::default().with_chunk_delay(Duration::from_millis(20));
  let (service, _) = service_with(Config::for_tests(), pipeline);
  service.scheduler().start_workers();

  let task = service.create(payload(3), true).await.unwrap();
  wait_for_status(&service, &task.id, TaskStatus::Processing).await;
  assert!(matches!(service.retry(&task.id, true).await, Err(TaskError::Conflict { .. })));

  let cancelled = service.cancel(&task.id).await.unwrap();
  assert_eq!(cancelled.status, TaskStatus::Failed);
  wait_until_idle(&service).await;

  let settled = service.get(&task.id).await.unwrap();
  assert_eq!(settled.status, TaskStatus::Failed);
  assert_eq!(settled.last_error.as_deref(), Some(CANCELLED_REASON));
  assert!(settled.problems.is_empty());

  let retried = service.retry(&task.id, false).await.unwrap();
  assert_eq!(retried.status, TaskStatus::Completed);
  assert_eq!(retried.problems.len(), 3);
  assert_eq!(retried.last_error, None);
  assert!(!service.scheduler().cancellations().contains(&task.id));
}

#[tokio::test]
async fn retry_waits_for_a_cancelled_run_to_let_go() {
  let pipeline = StubPipeline::default().with_chunk_delay(Duration::from_millis(40));
  let (service, _) = service_with(Config::for_tests(), pipeline);
  service.scheduler().start_workers();

  let task = service.create(payload(3), true).await.unwrap();
  wait_for_status(&service, &task.id, TaskStatus::Processing).await;
  service.cancel(&task.id).await.unwrap();

  for background in [true, false] {
    let err = assert_err!(service.retry(&task.id, background).await);
    assert!(matches!(err, TaskError::Conflict { .. }));
  }
  assert!(service.scheduler().cancellations().contains(&task.id));

  wait_until_idle(&service).await;
  let settled = service.get(&task.id).await.unwrap();
  assert_eq!(settled.status, TaskStatus::Failed);
  assert_eq!(settled.stage.as_deref(), Some("cancelled"));

  service.retry(&task.id, true).await.unwrap();
  let done = wait_for_status(&service, &task.id, TaskStatus::Completed).await;
  assert_eq!(done.problems.len(), 3);
}

#[tokio::test]
async fn pipeline_failures_are_recorded_and_workers_keep_going() {
  let (service, _) = service_with(Config::for_tests(), FailingPipeline);
  let a = service.create(payload(1), true).await.unwrap();
  let b = service.create(payload(1), true).await.unwrap();
  service.scheduler().start_workers();

  for id in [&a.id, &b.id] {
    let record = wait_for_status(&service, id, TaskStatus::Failed).await;
    assert_eq!(record.last_error.as_deref(), Some("model unavailable"));
    assert_eq!(record.stage.as_deref(), Some("failed"));
  }
  wait_until_idle(&service).await;

  let trail = service.get_stream_snapshot(&a.id, 0).await.unwrap();
  let marker: serde_json::Value = serde_json::from_str(&trail).unwrap();
  assert_eq!(marker, serde_json::json!({"stage": "failed", "message": "model unavailable"}));
}

#[tokio::test]
async fn foreground_failure_surfaces_to_the_caller() {
  let (service, _) = service_with(Config::for_tests(), FailingPipeline);
  let task = service.create(payload(1), false).await.unwrap();

  let err = service.process(&task.id, false).await.unwrap_err();
  assert!(matches!(err, TaskError::PipelineFailure { ref message, .. } if message == "model unavailable"));
  assert!(service.scheduler().in_flight().is_empty());
}

#[tokio::test]
async fn terminal_tasks_refuse_scheduling() {
  let service = stub_service();
  let task = service.create(payload(1), false).await.unwrap();
  let done = service.process(&task.id, false).await.unwrap();
  assert_eq!(done.status, TaskStatus::Completed);

  assert!(matches!(service.scheduler().enqueue(&task.id).await, Err(TaskError::Conflict { .. })));
  assert!(matches!(service.process(&task.id, false).await, Err(TaskError::Conflict { .. })));
  let unchanged = service.get(&task.id).await.unwrap();
  assert_eq!(unchanged.status, TaskStatus::Completed);
  assert_eq!(unchanged.problems, done.problems);
  assert!(service.scheduler().in_flight().is_empty());
}

#[tokio::test]
async fn delete_refuses_active_tasks() {
  let service = stub_service();
  let task = service.create(payload(1), false).await.unwrap();
  assert!(matches!(service.delete(&task.id).await, Err(TaskError::Conflict { .. })));

  service.process(&task.id, false).await.unwrap();
  assert_ne!(service.get_stream_snapshot(&task.id, 0).await.unwrap(), "");
  service.delete(&task.id).await.unwrap();
  assert!(matches!(service.get(&task.id).await, Err(TaskError::NotFound { .. })));
  assert!(matches!(service.get_stream_snapshot(&task.id, 0).await, Err(TaskError::NotFound { .. })));
}
