#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use taskweave::config::Config;
use taskweave::lifecycle::TaskStatus;
use taskweave::models::{PipelineResult, Problem, Solution, TagSet, TaskId, TaskPayload, TaskRecord};
use taskweave::pipeline::{Pipeline, StubPipeline};
use taskweave::service::TaskService;
use taskweave::store::{MemoryTaskStore, TaskStore};
use taskweave::worker_processing::PipelineContext;

/// Always fails after reporting one stage.
pub struct FailingPipeline;

#[async_trait]
impl Pipeline for FailingPipeline {
  async fn run(&self, _task: &TaskRecord, ctx: &PipelineContext) -> anyhow::Result<PipelineResult> {
    ctx.progress("extracting", "reading the submission").await?;
    Err(anyhow!("model unavailable"))
  }

  async fn solve_item(&self, _payload: &TaskPayload, _problem: &Problem) -> anyhow::Result<(Solution, TagSet)> {
    Err(anyhow!("model unavailable"))
  }

  async fn tag_item(&self, _: &TaskPayload, _: &Problem, _: Option<&Solution>) -> anyhow::Result<TagSet> {
    Err(anyhow!("model unavailable"))
  }
}

pub fn service_with(config: Config, pipeline: impl Pipeline) -> (TaskService, Arc<MemoryTaskStore>) {
  let store = Arc::new(MemoryTaskStore::new());
  let service = TaskService::new(config, store.clone() as Arc<dyn TaskStore>, Arc::new(pipeline));
  (service, store)
}

pub fn stub_service() -> TaskService {
  service_with(Config::for_tests(), StubPipeline::default()).0
}

pub fn payload(problem_count: usize) -> TaskPayload {
  TaskPayload {
    problem_count: Some(problem_count),
    ..TaskPayload::with_subject("math")
  }
}

pub async fn wait_for_status(service: &TaskService, task_id: &TaskId, status: TaskStatus) -> TaskRecord {
  let poll = async {
    loop {
      let record = service.get(task_id).await.unwrap();
      if record.status == status {
        return record;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  };
  tokio::time::timeout(Duration::from_secs(5), poll)
    .await
    .unwrap_or_else(|_| panic!("task {task_id} never reached {status}"))
}

pub async fn wait_until_idle(service: &TaskService) {
  let poll = async {
    while !service.scheduler().in_flight().is_empty() {
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  };
  tokio::time::timeout(Duration::from_secs(5), poll).await.unwrap();
}
