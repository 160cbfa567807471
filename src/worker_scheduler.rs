//! Bounded queue plus a fixed pool of workers.
//!
//! A task id may be owned by at most one worker: ownership is claimed in the
//! [`InFlightSet`] before the id is queued and released when the queue entry
//! (which carries the claim) is dropped, whatever the outcome of the run.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Cancelled, TaskError};
use crate::lifecycle::{CANCELLED_REASON, FailureKind, LifecycleEvent, STALE_REASON, TaskStatus};
use crate::messaging::{ProgressBroker, ProgressSnapshot, TaskEvent};
use crate::models::{TaskId, TaskRecord};
use crate::store::{TaskStore, TaskStoreExt};
use crate::stream_buffer::StreamBuffer;
use crate::worker_processing::TaskRunner;

type IdSet = Arc<Mutex<HashSet<TaskId>>>;

fn lock(set: &IdSet) -> MutexGuard<'_, HashSet<TaskId>> {
  set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Ids currently owned by a worker (queued or running).
#[derive(Debug, Clone, Default)]
pub struct InFlightSet {
  ids: IdSet,
}

impl InFlightSet {
  /// Claims `task_id`, or returns `None` if someone already owns it.
  pub fn try_claim(&self, task_id: &TaskId) -> Option<InFlightGuard> {
    if !lock(&self.ids).insert(task_id.clone()) {
      return None;
    }
    Some(InFlightGuard {
      ids: self.ids.clone(),
      task_id: task_id.clone(),
    })
  }

  pub fn contains(&self, task_id: &TaskId) -> bool {
    lock(&self.ids).contains(task_id)
  }

  pub fn len(&self) -> usize {
    lock(&self.ids).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// Releases its in-flight claim on drop.
#[derive(Debug)]
pub struct InFlightGuard {
  ids: IdSet,
  task_id: TaskId,
}

impl Drop for InFlightGuard {
  fn drop(&mut self) {
    lock(&self.ids).remove(&self.task_id);
  }
}

/// Ids marked for cancellation. Membership survives until an explicit retry.
#[derive(Debug, Clone, Default)]
pub struct CancellationSet {
  ids: IdSet,
}

impl CancellationSet {
  pub fn insert(&self, task_id: &TaskId) {
    lock(&self.ids).insert(task_id.clone());
  }

  pub fn remove(&self, task_id: &TaskId) {
    lock(&self.ids).remove(task_id);
  }

  pub fn contains(&self, task_id: &TaskId) -> bool {
    lock(&self.ids).contains(task_id)
  }

  pub fn token(&self, task_id: &TaskId) -> CancelToken {
    CancelToken {
      set: self.clone(),
      task_id: task_id.clone(),
    }
  }
}

/// A view of one task's cancellation flag, handed to the pipeline run.
#[derive(Debug, Clone)]
pub struct CancelToken {
  set: CancellationSet,
  task_id: TaskId,
}

impl CancelToken {
  pub fn is_cancelled(&self) -> bool {
    self.set.contains(&self.task_id)
  }

  pub fn check(&self) -> Result<(), Cancelled> {
    if self.is_cancelled() { Err(Cancelled) } else { Ok(()) }
  }
}

/// Queue payload. Holding the guard here ties the in-flight claim to the
/// entry's lifetime: a rejected push or a finished run drops it.
#[derive(Debug)]
struct QueueEntry {
  task_id: TaskId,
  enqueued_at: Instant,
  _claim: InFlightGuard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
  Queued,
  /// A worker already owns the task; nothing was pushed.
  AlreadyInFlight,
}

pub struct Scheduler {
  store: Arc<dyn TaskStore>,
  broker: ProgressBroker,
  buffer: Arc<StreamBuffer>,
  runner: TaskRunner,
  tx: flume::Sender<QueueEntry>,
  rx: flume::Receiver<QueueEntry>,
  capacity: usize,
  in_flight: InFlightSet,
  cancellations: CancellationSet,
  workers_started: AtomicBool,
  worker_count: usize,
  autostart: bool,
  pop_timeout: Duration,
  stale_after: Duration,
}

impl Scheduler {
  pub fn new(
    config: &Config,
    store: Arc<dyn TaskStore>,
    broker: ProgressBroker,
    buffer: Arc<StreamBuffer>,
    runner: TaskRunner,
  ) -> Self {
    let (tx, rx) = match config.queue_capacity {
      0 => flume::unbounded(),
      capacity => flume::bounded(capacity),
    };
    Self {
      store,
      broker,
      buffer,
      runner,
      tx,
      rx,
      capacity: config.queue_capacity,
      in_flight: InFlightSet::default(),
      cancellations: CancellationSet::default(),
      workers_started: AtomicBool::new(false),
      worker_count: config.worker_count.max(1),
      autostart: config.autostart_workers,
      pop_timeout: config.worker_pop_timeout,
      stale_after: config.stale_after,
    }
  }

  /// Spawns the worker pool once; later calls are no-ops. Must run inside a
  /// tokio runtime.
  pub fn start_workers(&self) -> bool {
    if self.workers_started.swap(true, Ordering::SeqCst) {
      return false;
    }
    for worker_id in 1..=self.worker_count {
      tokio::spawn(worker_loop(
        worker_id,
        self.rx.clone(),
        self.runner.clone(),
        self.cancellations.clone(),
        self.pop_timeout,
      ));
    }
    info!(workers = self.worker_count, capacity = self.capacity, "task workers started");
    true
  }

  pub fn ensure_workers_started(&self) {
    if self.autostart {
      self.start_workers();
    }
  }

  pub fn in_flight(&self) -> &InFlightSet {
    &self.in_flight
  }

  pub fn cancellations(&self) -> &CancellationSet {
    &self.cancellations
  }

  pub fn queue_len(&self) -> usize {
    self.tx.len()
  }

  pub async fn enqueue(&self, task_id: &TaskId) -> Result<Enqueued, TaskError> {
    self.ensure_workers_started();

    let record = self.store.get(task_id).await?;
    if record.status != TaskStatus::Pending {
      return Err(TaskError::conflict(task_id, format!("cannot queue a {} task", record.status)));
    }
    let Some(claim) = self.in_flight.try_claim(task_id) else {
      debug!(task_id = %task_id, "task already in flight");
      return Ok(Enqueued::AlreadyInFlight);
    };

    let entry = QueueEntry {
      task_id: task_id.clone(),
      enqueued_at: Instant::now(),
      _claim: claim,
    };
    if let Err(rejected) = self.tx.try_send(entry) {
      drop(rejected);
      warn!(task_id = %task_id, capacity = self.capacity, "task queue saturated");
      return Err(TaskError::QueueSaturated { capacity: self.capacity });
    }

    // A worker may already have picked the task up; then "queued" is stale news.
    match self
      .store
      .set_pending_stage(task_id, "queued".into(), "queued, waiting for a worker".into())
      .await
    {
      Ok(record) => {
        self.broker.publish(task_id, TaskEvent::Progress(ProgressSnapshot::from(&record)));
      }
      Err(e) => debug!(task_id = %task_id, error = %e, "skipping queued stage"),
    }
    info!(task_id = %task_id, queued = self.queue_len(), "task queued");
    Ok(Enqueued::Queued)
  }

  /// Runs the task on the caller's own future and returns the final record.
  pub async fn run_foreground(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError> {
    self.store.get(task_id).await?;
    let _claim = self
      .in_flight
      .try_claim(task_id)
      .ok_or_else(|| TaskError::conflict(task_id, "task is already queued or running"))?;
    self.runner.run_task(task_id, self.cancellations.token(task_id)).await
  }

  /// Marks the task cancelled and fails it right away; the owning worker
  /// reaches the same state at its next checkpoint. Terminal tasks are
  /// returned unchanged.
  pub async fn cancel(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError> {
    let record = self.store.get(task_id).await?;
    if record.status.is_terminal() {
      return Ok(record);
    }

    self.cancellations.insert(task_id);
    let record = match self
      .store
      .mark_failed(task_id, LifecycleEvent::Cancel, CANCELLED_REASON.into(), "cancelled", "cancelled by user".into())
      .await
    {
      Ok(record) => record,
      Err(TaskError::Conflict { .. }) => return self.store.get(task_id).await,
      Err(e) => return Err(e),
    };
    self.broker.publish(task_id, TaskEvent::Progress(ProgressSnapshot::from(&record)));
    info!(task_id = %task_id, "task cancelled");
    Ok(record)
  }

  pub async fn retry(&self, task_id: &TaskId, background: bool) -> Result<TaskRecord, TaskError> {
    let record = self.store.get(task_id).await?;
    if record.status == TaskStatus::Processing {
      return Err(TaskError::conflict(task_id, "task is still processing"));
    }
    // A cancelled run keeps its claim until it reaches its next checkpoint.
    if self.in_flight.contains(task_id) {
      return Err(TaskError::conflict(task_id, "previous run has not released the task yet"));
    }

    self.cancellations.remove(task_id);
    self.buffer.clear(task_id).await;
    if record.status.is_terminal() {
      self.store.reset_for_retry(task_id).await?;
    }
    if record.status == TaskStatus::Failed {
      let previous = FailureKind::classify(record.last_error.as_deref());
      info!(task_id = %task_id, background, previous = ?previous, "retrying failed task");
    } else {
      info!(task_id = %task_id, background, "retrying task");
    }

    if background {
      self.enqueue(task_id).await?;
      self.store.get(task_id).await
    } else {
      self.run_foreground(task_id).await
    }
  }

  /// Fails every orphaned `Processing` task. Returns the ids it reclaimed.
  pub async fn reclaim_stale(&self) -> Result<Vec<TaskId>, TaskError> {
    let mut reclaimed = Vec::new();
    for record in self.store.list_all().await? {
      if let Some(record) = self.reclaim_if_stale(&record).await? {
        reclaimed.push(record.id);
      }
    }
    Ok(reclaimed)
  }

  /// Fails `record` if it is `Processing`, unowned and idle past the
  /// threshold. Returns the updated record when it did.
  pub async fn reclaim_if_stale(&self, record: &TaskRecord) -> Result<Option<TaskRecord>, TaskError> {
    if !self.is_stale(record) {
      return Ok(None);
    }
    match self
      .store
      .mark_failed(
        &record.id,
        LifecycleEvent::Stale,
        STALE_REASON.into(),
        "failed",
        "processing went stale; retry to run it again".into(),
      )
      .await
    {
      Ok(updated) => {
        warn!(task_id = %record.id, last_update = %record.updated_at, "reclaimed stale task");
        self.broker.publish(&record.id, TaskEvent::Progress(ProgressSnapshot::from(&updated)));
        Ok(Some(updated))
      }
      Err(TaskError::Conflict { .. }) | Err(TaskError::NotFound { .. }) => Ok(None),
      Err(e) => Err(e),
    }
  }

  fn is_stale(&self, record: &TaskRecord) -> bool {
    if record.status != TaskStatus::Processing || self.in_flight.contains(&record.id) {
      return false;
    }
    Utc::now()
      .signed_duration_since(record.updated_at)
      .to_std()
      .is_ok_and(|age| age > self.stale_after)
  }
}

async fn worker_loop(
  worker_id: usize,
  rx: flume::Receiver<QueueEntry>,
  runner: TaskRunner,
  cancellations: CancellationSet,
  pop_timeout: Duration,
) {
  debug!(worker_id, "worker loop running");
  loop {
    let entry = match tokio::time::timeout(pop_timeout, rx.recv_async()).await {
      Err(_) => continue,
      Ok(Ok(entry)) => entry,
      Ok(Err(_)) => {
        info!(worker_id, "task queue closed, worker exiting");
        return;
      }
    };

    let task_id = entry.task_id.clone();
    debug!(
      worker_id,
      task_id = %task_id,
      waited_ms = entry.enqueued_at.elapsed().as_millis() as u64,
      "task dequeued"
    );

    // Run on its own task so a panicking pipeline cannot take the worker down.
    let job = {
      let runner = runner.clone();
      let task_id = task_id.clone();
      let token = cancellations.token(&task_id);
      tokio::spawn(async move { runner.run_task(&task_id, token).await })
    };
    match job.await {
      Ok(Ok(record)) => info!(worker_id, task_id = %task_id, status = %record.status, "task finished"),
      Ok(Err(e)) => warn!(worker_id, task_id = %task_id, error = %e, "task did not complete"),
      Err(e) => {
        error!(worker_id, task_id = %task_id, error = %e, "task run aborted");
        if let Err(e) = runner.fail_task(&task_id, format!("worker crashed: {e}")).await {
          warn!(worker_id, task_id = %task_id, error = %e, "could not record crash");
        }
      }
    }
    drop(entry);
  }
}
