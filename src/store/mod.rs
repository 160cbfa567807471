//! Durable task records.
//!
//! The store is the single source of truth for task state. Its one write
//! primitive, [`TaskStore::update`], runs a mutation as an atomic
//! read-modify-write and stamps `updated_at`, so a worker's progress patch
//! and the stale reaper can never lose each other's writes.

use async_trait::async_trait;
use chrono::Utc;

use crate::error::TaskError;
use crate::lifecycle::{LifecycleEvent, TaskStatus};
use crate::models::{PipelineResult, TaskId, TaskPayload, TaskRecord};

pub mod file;
pub mod memory;

pub use file::FileTaskStore;
pub use memory::MemoryTaskStore;

/// A change applied to one record under the store's lock. Returning an
/// error aborts the write and leaves the record untouched.
pub type Mutation = Box<dyn FnOnce(&mut TaskRecord) -> Result<(), TaskError> + Send>;

#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
  /// Stores `record` exactly as given, including its timestamps.
  async fn insert(&self, record: TaskRecord) -> Result<TaskRecord, TaskError>;

  async fn get(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError>;

  async fn list_all(&self) -> Result<Vec<TaskRecord>, TaskError>;

  async fn update(&self, task_id: &TaskId, mutation: Mutation) -> Result<TaskRecord, TaskError>;

  async fn delete(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError>;
}

/// Applies `mutation` to a copy of `record`, stamping `updated_at` on success.
pub(crate) fn apply_mutation(record: &TaskRecord, mutation: Mutation) -> Result<TaskRecord, TaskError> {
  let mut next = record.clone();
  mutation(&mut next)?;
  next.updated_at = Utc::now();
  Ok(next)
}

fn advance(record: &mut TaskRecord, event: LifecycleEvent) -> Result<(), TaskError> {
  let next = record.status.transition(event).ok_or_else(|| {
    TaskError::conflict(&record.id, format!("cannot apply {event:?} to a {} task", record.status))
  })?;
  record.status = next;
  Ok(())
}

/// Lifecycle-aware writes shared by the scheduler and the facade.
#[async_trait]
pub trait TaskStoreExt: TaskStore {
  async fn create(&self, payload: TaskPayload) -> Result<TaskRecord, TaskError> {
    self.insert(TaskRecord::new(payload)).await
  }

  async fn mark_processing(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError> {
    self
      .update(
        task_id,
        Box::new(|r| {
          advance(r, LifecycleEvent::Dequeue)?;
          r.stage = Some("starting".into());
          r.stage_message = Some("processing started".into());
          Ok(())
        }),
      )
      .await
  }

  /// Moves the task into `Failed` through `event` (`Fail`, `Cancel` or `Stale`).
  async fn mark_failed(
    &self,
    task_id: &TaskId,
    event: LifecycleEvent,
    reason: String,
    stage: &'static str,
    stage_message: String,
  ) -> Result<TaskRecord, TaskError> {
    self
      .update(
        task_id,
        Box::new(move |r| {
          advance(r, event)?;
          r.last_error = Some(reason);
          r.stage = Some(stage.into());
          r.stage_message = Some(stage_message);
          Ok(())
        }),
      )
      .await
  }

  async fn save_pipeline_result(&self, task_id: &TaskId, result: PipelineResult) -> Result<TaskRecord, TaskError> {
    self
      .update(
        task_id,
        Box::new(move |r| {
          advance(r, LifecycleEvent::Succeed)?;
          r.last_error = None;
          r.problems = result.problems;
          r.solutions = result.solutions;
          r.tags = result.tags;
          r.archive = result.archive;
          r.stage = Some("done".into());
          r.stage_message = Some("completed".into());
          Ok(())
        }),
      )
      .await
  }

  /// Advisory progress label written by a running pipeline; refused unless
  /// the task is `Processing`.
  async fn set_stage(&self, task_id: &TaskId, stage: String, message: Option<String>) -> Result<TaskRecord, TaskError> {
    self
      .update(
        task_id,
        Box::new(move |r| {
          if r.status != TaskStatus::Processing {
            return Err(TaskError::conflict(&r.id, format!("task is already {}", r.status)));
          }
          r.stage = Some(stage);
          r.stage_message = message;
          Ok(())
        }),
      )
      .await
  }

  /// Like [`set_stage`](Self::set_stage) but only while the task is still `Pending`.
  async fn set_pending_stage(&self, task_id: &TaskId, stage: String, message: String) -> Result<TaskRecord, TaskError> {
    self
      .update(
        task_id,
        Box::new(move |r| {
          if r.status != TaskStatus::Pending {
            return Err(TaskError::conflict(&r.id, format!("task is already {}", r.status)));
          }
          r.stage = Some(stage);
          r.stage_message = Some(message);
          Ok(())
        }),
      )
      .await
  }

  /// Re-enters a terminal task at `Pending` and forgets its last failure.
  async fn reset_for_retry(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError> {
    self
      .update(
        task_id,
        Box::new(|r| {
          advance(r, LifecycleEvent::Retry)?;
          r.last_error = None;
          r.stage = Some("retrying".into());
          r.stage_message = Some("waiting to retry".into());
          Ok(())
        }),
      )
      .await
  }
}

impl<S: TaskStore + ?Sized> TaskStoreExt for S {}
