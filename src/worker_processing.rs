use std::sync::Arc;

use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::error::{Cancelled, TaskError};
use crate::lifecycle::{CANCELLED_REASON, LifecycleEvent, TaskStatus};
use crate::messaging::{LlmDelta, ProgressBroker, ProgressSnapshot, TaskEvent};
use crate::models::{TaskId, TaskRecord};
use crate::pipeline::Pipeline;
use crate::store::{TaskStore, TaskStoreExt};
use crate::stream_buffer::StreamBuffer;
use crate::worker_scheduler::CancelToken;

/// What a running pipeline sees of the outside world: progress reporting,
/// incremental output and the task's cancellation flag.
pub struct PipelineContext {
  task_id: TaskId,
  store: Arc<dyn TaskStore>,
  broker: ProgressBroker,
  buffer: Arc<StreamBuffer>,
  cancel: CancelToken,
}

impl PipelineContext {
  pub fn task_id(&self) -> &TaskId {
    &self.task_id
  }

  pub fn ensure_not_cancelled(&self) -> Result<(), Cancelled> {
    self.cancel.check()
  }

  /// Records a stage change and broadcasts it. Fails with [`Cancelled`] when
  /// the task was cancelled or has otherwise left `Processing`.
  pub async fn progress(&self, stage: &str, message: impl Into<String>) -> Result<(), Cancelled> {
    self.cancel.check()?;
    match self.store.set_stage(&self.task_id, stage.to_owned(), Some(message.into())).await {
      Ok(record) => {
        self.broker.publish(&self.task_id, TaskEvent::Progress(ProgressSnapshot::from(&record)));
        Ok(())
      }
      Err(TaskError::Conflict { .. }) | Err(TaskError::NotFound { .. }) => Err(Cancelled),
      Err(e) => {
        warn!(task_id = %self.task_id, stage, error = %e, "failed to record stage");
        Ok(())
      }
    }
  }

  /// Appends a chunk of model output for `problem_id` and broadcasts it.
  pub async fn delta(&self, problem_id: &str, kind: &str, text: &str) -> Result<(), Cancelled> {
    if text.is_empty() {
      return Ok(());
    }
    self.cancel.check()?;
    self.buffer.append(&self.task_id, text).await;
    self.broker.publish(
      &self.task_id,
      TaskEvent::LlmDelta(LlmDelta {
        task_id: self.task_id.clone(),
        problem_id: problem_id.to_owned(),
        kind: kind.to_owned(),
        delta: text.to_owned(),
      }),
    );
    Ok(())
  }
}

/// Runs one task through the pipeline and settles it in the store.
#[derive(Clone)]
pub struct TaskRunner {
  store: Arc<dyn TaskStore>,
  broker: ProgressBroker,
  buffer: Arc<StreamBuffer>,
  pipeline: Arc<dyn Pipeline>,
}

impl TaskRunner {
  pub fn new(
    store: Arc<dyn TaskStore>,
    broker: ProgressBroker,
    buffer: Arc<StreamBuffer>,
    pipeline: Arc<dyn Pipeline>,
  ) -> Self {
    Self { store, broker, buffer, pipeline }
  }

  /// Returns the settled record for completed and cancelled runs, and
  /// `PipelineFailure` when the pipeline itself failed.
  pub async fn run_task(&self, task_id: &TaskId, cancel: CancelToken) -> Result<TaskRecord, TaskError> {
    if cancel.is_cancelled() {
      return self.finish_cancelled(task_id).await;
    }

    let record = self.store.mark_processing(task_id).await?;
    info!(task_id = %task_id, subject = %record.payload.subject, "task processing");
    self.publish(&record);

    let ctx = PipelineContext {
      task_id: task_id.clone(),
      store: self.store.clone(),
      broker: self.broker.clone(),
      buffer: self.buffer.clone(),
      cancel: cancel.clone(),
    };

    match self.pipeline.run(&record, &ctx).await {
      Ok(result) => {
        let result = result.merge_manual_fields(&record.payload);
        match self.store.save_pipeline_result(task_id, result).await {
          Ok(saved) => {
            info!(task_id = %task_id, problems = saved.problems.len(), "task completed");
            self.publish(&saved);
            Ok(saved)
          }
          // Cancelled or reclaimed while the pipeline was running.
          Err(TaskError::Conflict { reason, .. }) => {
            debug!(task_id = %task_id, reason = %reason, "discarding result of a settled task");
            self.store.get(task_id).await
          }
          Err(e) => self.finish_failed(task_id, e.to_string()).await,
        }
      }
      Err(err) if err.downcast_ref::<Cancelled>().is_some() || cancel.is_cancelled() => {
        self.finish_cancelled(task_id).await
      }
      Err(err) => self.finish_failed(task_id, format!("{err:#}")).await,
    }
  }

  /// Fails a task whose run ended abnormally.
  pub async fn fail_task(&self, task_id: &TaskId, message: String) -> Result<TaskRecord, TaskError> {
    self.finish_failed(task_id, message).await
  }

  fn publish(&self, record: &TaskRecord) {
    self.broker.publish(&record.id, TaskEvent::Progress(ProgressSnapshot::from(record)));
  }

  async fn finish_cancelled(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError> {
    let record = match self
      .store
      .mark_failed(task_id, LifecycleEvent::Cancel, CANCELLED_REASON.into(), "cancelled", "cancelled by user".into())
      .await
    {
      Ok(record) => record,
      Err(TaskError::Conflict { .. }) => self.store.get(task_id).await?,
      Err(e) => return Err(e),
    };
    info!(task_id = %task_id, "task run stopped by cancellation");
    self.publish(&record);
    Ok(record)
  }

  async fn finish_failed(&self, task_id: &TaskId, message: String) -> Result<TaskRecord, TaskError> {
    error!(task_id = %task_id, error = %message, "task failed");
    match self
      .store
      .mark_failed(task_id, LifecycleEvent::Fail, message.clone(), "failed", "processing failed".into())
      .await
    {
      Ok(_) | Err(TaskError::Conflict { .. }) => {}
      Err(e) => warn!(task_id = %task_id, error = %e, "could not record failure"),
    }

    let marker = json!({ "stage": "failed", "message": message }).to_string();
    self.buffer.append(task_id, &marker).await;
    self.broker.publish(
      task_id,
      TaskEvent::Progress(ProgressSnapshot::new(task_id, TaskStatus::Failed, "failed", message.clone())),
    );

    Err(TaskError::PipelineFailure {
      task_id: task_id.clone(),
      message,
    })
  }
}
