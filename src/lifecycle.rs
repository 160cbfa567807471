//! Task status state machine.
//!
//! ```text
//! Pending --dequeue--> Processing --succeed--> Completed
//!    |                     |
//!    +--cancel--> Failed <-+--fail | cancel | stale
//!
//! Completed | Failed --retry--> Pending
//! ```
//!
//! Every other (status, event) pair is rejected, which is what keeps terminal
//! records immutable for the scheduler.

use std::fmt;

use serde::{Deserialize, Serialize};

/// `last_error` written when a task is cancelled.
pub const CANCELLED_REASON: &str = "cancelled";

/// `last_error` written when the stale reaper fails an orphaned task.
pub const STALE_REASON: &str = "stale: worker crashed or process restarted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
  Pending,
  Processing,
  Completed,
  Failed,
}

impl TaskStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, TaskStatus::Completed | TaskStatus::Failed)
  }

  pub fn is_active(self) -> bool {
    !self.is_terminal()
  }

  pub fn as_str(self) -> &'static str {
    match self {
      TaskStatus::Pending => "pending",
      TaskStatus::Processing => "processing",
      TaskStatus::Completed => "completed",
      TaskStatus::Failed => "failed",
    }
  }

  /// Applies `event` to `self`, or returns `None` when the pair has no transition.
  pub fn transition(self, event: LifecycleEvent) -> Option<TaskStatus> {
    use LifecycleEvent::*;
    use TaskStatus::*;
    match (self, event) {
      (Pending, Dequeue) => Some(Processing),
      (Processing, Succeed) => Some(Completed),
      (Processing, Fail | Cancel | Stale) => Some(Failed),
      (Pending, Cancel) => Some(Failed),
      (Completed | Failed, Retry) => Some(Pending),
      _ => None,
    }
  }
}

impl fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl std::str::FromStr for TaskStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "pending" => Ok(TaskStatus::Pending),
      "processing" => Ok(TaskStatus::Processing),
      "completed" => Ok(TaskStatus::Completed),
      "failed" => Ok(TaskStatus::Failed),
      other => Err(format!("unknown task status '{other}'")),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
  Dequeue,
  Succeed,
  Fail,
  Cancel,
  Stale,
  Retry,
}

/// Why a failed task failed, recovered from its reserved `last_error` text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
  Cancelled,
  Stale,
  Pipeline,
}

impl FailureKind {
  pub fn classify(last_error: Option<&str>) -> FailureKind {
    match last_error {
      Some(CANCELLED_REASON) => FailureKind::Cancelled,
      Some(STALE_REASON) => FailureKind::Stale,
      _ => FailureKind::Pipeline,
    }
  }
}
