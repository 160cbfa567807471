//! In-process publish/subscribe for per-task progress.
//!
//! Every subscriber owns a bounded mailbox. Publishing snapshots the current
//! subscribers under a short lock, releases it, then does a non-blocking send
//! to each mailbox; a full mailbox drops the event so a slow reader can never
//! stall a worker. Per (task, subscriber) events arrive in publish order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::debug;

use crate::lifecycle::TaskStatus;
use crate::models::{TaskId, TaskRecord};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
  pub task_id: TaskId,
  pub status: TaskStatus,
  pub stage: Option<String>,
  pub message: Option<String>,
}

impl ProgressSnapshot {
  pub fn new(task_id: &TaskId, status: TaskStatus, stage: &str, message: impl Into<String>) -> Self {
    Self {
      task_id: task_id.clone(),
      status,
      stage: Some(stage.to_owned()),
      message: Some(message.into()),
    }
  }
}

impl From<&TaskRecord> for ProgressSnapshot {
  fn from(record: &TaskRecord) -> Self {
    Self {
      task_id: record.id.clone(),
      status: record.status,
      stage: record.stage.clone(),
      message: record.stage_message.clone(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LlmDelta {
  pub task_id: TaskId,
  pub problem_id: String,
  pub kind: String,
  pub delta: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
  Progress(ProgressSnapshot),
  LlmDelta(LlmDelta),
  LlmSnapshot { task_id: TaskId, text: String },
  Done,
  Error { error: String },
}

impl TaskEvent {
  pub fn name(&self) -> &'static str {
    match self {
      TaskEvent::Progress(_) => "progress",
      TaskEvent::LlmDelta(_) => "llm_delta",
      TaskEvent::LlmSnapshot { .. } => "llm_snapshot",
      TaskEvent::Done => "done",
      TaskEvent::Error { .. } => "error",
    }
  }

  pub fn data(&self) -> Value {
    match self {
      TaskEvent::Progress(p) => serde_json::to_value(p).unwrap_or(Value::Null),
      TaskEvent::LlmDelta(d) => serde_json::to_value(d).unwrap_or(Value::Null),
      TaskEvent::LlmSnapshot { task_id, text } => json!({ "task_id": task_id, "text": text }),
      TaskEvent::Done => json!({}),
      TaskEvent::Error { error } => json!({ "error": error }),
    }
  }
}

type Subscribers = HashMap<TaskId, Vec<(u64, mpsc::Sender<TaskEvent>)>>;

#[derive(Debug)]
struct BrokerInner {
  mailbox_capacity: usize,
  next_id: AtomicU64,
  subscribers: Mutex<Subscribers>,
}

impl BrokerInner {
  fn lock(&self) -> MutexGuard<'_, Subscribers> {
    self.subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn remove(&self, task_id: &TaskId, mailbox_id: u64) {
    let mut subs = self.lock();
    if let Some(list) = subs.get_mut(task_id) {
      list.retain(|(id, _)| *id != mailbox_id);
      if list.is_empty() {
        subs.remove(task_id);
      }
    }
  }
}

#[derive(Debug, Clone)]
pub struct ProgressBroker {
  inner: Arc<BrokerInner>,
}

impl Default for ProgressBroker {
  fn default() -> Self {
    Self::new(1000)
  }
}

impl ProgressBroker {
  pub fn new(mailbox_capacity: usize) -> Self {
    Self {
      inner: Arc::new(BrokerInner {
        mailbox_capacity: mailbox_capacity.max(1),
        next_id: AtomicU64::new(0),
        subscribers: Mutex::new(HashMap::new()),
      }),
    }
  }

  pub fn subscribe(&self, task_id: &TaskId) -> Mailbox {
    let (tx, rx) = mpsc::channel(self.inner.mailbox_capacity);
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
    self.inner.lock().entry(task_id.clone()).or_default().push((id, tx));
    Mailbox {
      task_id: task_id.clone(),
      id,
      rx,
      broker: Arc::downgrade(&self.inner),
    }
  }

  /// Deregisters `mailbox`. Dropping the mailbox has the same effect.
  pub fn unsubscribe(&self, mailbox: &Mailbox) {
    self.inner.remove(&mailbox.task_id, mailbox.id);
  }

  /// Returns how many mailboxes accepted the event.
  pub fn publish(&self, task_id: &TaskId, event: TaskEvent) -> usize {
    let targets: Vec<mpsc::Sender<TaskEvent>> = match self.inner.lock().get(task_id) {
      Some(list) => list.iter().map(|(_, tx)| tx.clone()).collect(),
      None => return 0,
    };

    let mut delivered = 0;
    for tx in targets {
      match tx.try_send(event.clone()) {
        Ok(()) => delivered += 1,
        Err(mpsc::error::TrySendError::Full(_)) => {
          debug!(task_id = %task_id, event = event.name(), "mailbox full, dropping event");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
      }
    }
    delivered
  }

  pub fn subscriber_count(&self, task_id: &TaskId) -> usize {
    self.inner.lock().get(task_id).map_or(0, Vec::len)
  }

  pub fn has_subscribers(&self, task_id: &TaskId) -> bool {
    self.inner.lock().contains_key(task_id)
  }
}

/// A subscriber's private, bounded event buffer for one task.
#[derive(Debug)]
pub struct Mailbox {
  task_id: TaskId,
  id: u64,
  rx: mpsc::Receiver<TaskEvent>,
  broker: Weak<BrokerInner>,
}

impl Mailbox {
  pub fn task_id(&self) -> &TaskId {
    &self.task_id
  }

  /// Waits up to `timeout` for the next event.
  pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<TaskEvent> {
    tokio::time::timeout(timeout, self.rx.recv()).await.ok().flatten()
  }

  pub fn try_recv(&mut self) -> Option<TaskEvent> {
    self.rx.try_recv().ok()
  }
}

impl Drop for Mailbox {
  fn drop(&mut self) {
    if let Some(inner) = self.broker.upgrade() {
      inner.remove(&self.task_id, self.id);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn progress(task_id: &TaskId, stage: &str) -> TaskEvent {
    TaskEvent::Progress(ProgressSnapshot::new(task_id, TaskStatus::Processing, stage, stage))
  }

  #[tokio::test]
  async fn every_subscriber_gets_events_in_order() {
    let broker = ProgressBroker::default();
    let id = TaskId::new();
    let mut a = broker.subscribe(&id);
    let mut b = broker.subscribe(&id);

    for stage in ["extracting", "solving", "tagging"] {
      assert_eq!(broker.publish(&id, progress(&id, stage)), 2);
    }

    for mailbox in [&mut a, &mut b] {
      for stage in ["extracting", "solving", "tagging"] {
        assert_eq!(mailbox.try_recv(), Some(progress(&id, stage)));
      }
      assert_eq!(mailbox.try_recv(), None);
    }
  }

  #[tokio::test]
  async fn events_do_not_cross_tasks() {
    let broker = ProgressBroker::default();
    let (one, two) = (TaskId::new(), TaskId::new());
    let mut mailbox = broker.subscribe(&one);
    assert_eq!(broker.publish(&two, TaskEvent::Done), 0);
    assert_eq!(mailbox.try_recv(), None);
  }

  #[tokio::test]
  async fn full_mailbox_drops_instead_of_blocking() {
    let broker = ProgressBroker::new(2);
    let id = TaskId::new();
    let mut mailbox = broker.subscribe(&id);

    assert_eq!(broker.publish(&id, progress(&id, "a")), 1);
    assert_eq!(broker.publish(&id, progress(&id, "b")), 1);
    assert_eq!(broker.publish(&id, progress(&id, "c")), 0);

    assert_eq!(mailbox.try_recv(), Some(progress(&id, "a")));
    assert_eq!(mailbox.try_recv(), Some(progress(&id, "b")));
    assert_eq!(mailbox.try_recv(), None);
  }

  #[tokio::test]
  async fn unsubscribe_removes_empty_entries() {
    let broker = ProgressBroker::default();
    let id = TaskId::new();
    let first = broker.subscribe(&id);
    let second = broker.subscribe(&id);
    assert_eq!(broker.subscriber_count(&id), 2);

    broker.unsubscribe(&first);
    assert_eq!(broker.subscriber_count(&id), 1);
    drop(second);
    assert!(!broker.has_subscribers(&id));
    drop(first);
    assert!(!broker.has_subscribers(&id));
  }

  #[tokio::test]
  async fn recv_timeout_returns_none_when_idle() {
    let broker = ProgressBroker::default();
    let id = TaskId::new();
    let mut mailbox = broker.subscribe(&id);
    assert_eq!(mailbox.recv_timeout(Duration::from_millis(10)).await, None);
  }

  #[test]
  fn event_payloads_match_wire_names() {
    let id = TaskId::from("abc");
    assert_eq!(TaskEvent::Done.data(), json!({}));
    let delta = TaskEvent::LlmDelta(LlmDelta {
      task_id: id.clone(),
      problem_id: "p1".into(),
      kind: "solve".into(),
      delta: "x".into(),
    });
    assert_eq!(delta.name(), "llm_delta");
    assert_eq!(delta.data()["problem_id"], "p1");
    let p = progress(&id, "solving");
    assert_eq!(p.data()["status"], "processing");
  }
}
