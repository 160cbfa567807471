use thiserror::Error;

use crate::models::TaskId;

/// Errors surfaced by the task store, the scheduler and the service facade.
#[derive(Debug, Error)]
pub enum TaskError {
  #[error("task {task_id} not found")]
  NotFound { task_id: TaskId },

  #[error("problem {item_id} not found in task {task_id}")]
  ItemNotFound { task_id: TaskId, item_id: String },

  #[error("task {task_id}: {reason}")]
  Conflict { task_id: TaskId, reason: String },

  #[error("task queue is full (capacity {capacity})")]
  QueueSaturated { capacity: usize },

  #[error("pipeline failed for task {task_id}: {message}")]
  PipelineFailure { task_id: TaskId, message: String },

  #[error("task {task_id} was cancelled")]
  Cancelled { task_id: TaskId },

  #[error("task {task_id} went stale")]
  Stale { task_id: TaskId },

  #[error("storage error: {0}")]
  Storage(#[from] std::io::Error),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl TaskError {
  pub fn not_found(task_id: &TaskId) -> Self {
    TaskError::NotFound { task_id: task_id.clone() }
  }

  pub fn conflict(task_id: &TaskId, reason: impl Into<String>) -> Self {
    TaskError::Conflict {
      task_id: task_id.clone(),
      reason: reason.into(),
    }
  }
}

/// Raised through a pipeline when the task it works on has been cancelled.
///
/// Pipelines return `anyhow::Result`; the worker recognises this value by
/// downcasting, so a pipeline only has to propagate it with `?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("task cancelled")]
pub struct Cancelled;
