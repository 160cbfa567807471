use std::sync::Arc;
use std::time::Instant;

use async_stream::stream;
use futures::Stream;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::TaskError;
use crate::messaging::{ProgressBroker, ProgressSnapshot, TaskEvent};
use crate::models::{
  ProblemOverride, ProblemSummary, TagSet, TaskFilter, TaskId, TaskPayload, TaskRecord, TaskSummary, merge_unique,
};
use crate::pipeline::Pipeline;
use crate::store::{FileTaskStore, MemoryTaskStore, TaskStore, TaskStoreExt};
use crate::stream_buffer::{StreamBuffer, tail_chars};
use crate::worker_processing::TaskRunner;
use crate::worker_scheduler::{Enqueued, Scheduler};

/// One item of a live task feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
  Event(TaskEvent),
  KeepAlive,
}

/// The orchestration facade: every public task operation goes through here.
#[derive(Clone)]
pub struct TaskService {
  config: Arc<Config>,
  store: Arc<dyn TaskStore>,
  broker: ProgressBroker,
  buffer: Arc<StreamBuffer>,
  scheduler: Arc<Scheduler>,
  pipeline: Arc<dyn Pipeline>,
}

impl TaskService {
  pub fn new(config: Config, store: Arc<dyn TaskStore>, pipeline: Arc<dyn Pipeline>) -> Self {
    let broker = ProgressBroker::new(config.mailbox_capacity);
    let buffer = Arc::new(if config.persist_tasks {
      StreamBuffer::persistent(&config.stream_dir, config.stream_cache_max_chars)
    } else {
      StreamBuffer::in_memory(config.stream_cache_max_chars)
    });
    let runner = TaskRunner::new(store.clone(), broker.clone(), buffer.clone(), pipeline.clone());
    let scheduler = Arc::new(Scheduler::new(&config, store.clone(), broker.clone(), buffer.clone(), runner));
    Self {
      config: Arc::new(config),
      store,
      broker,
      buffer,
      scheduler,
      pipeline,
    }
  }

  /// Picks the store the configuration asks for.
  pub async fn from_config(config: Config, pipeline: Arc<dyn Pipeline>) -> Result<Self, TaskError> {
    let store: Arc<dyn TaskStore> = if config.persist_tasks {
      Arc::new(FileTaskStore::open(&config.tasks_dir).await?)
    } else {
      Arc::new(MemoryTaskStore::new())
    };
    Ok(Self::new(config, store, pipeline))
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn scheduler(&self) -> &Scheduler {
    &self.scheduler
  }

  pub fn broker(&self) -> &ProgressBroker {
    &self.broker
  }

  pub async fn create(&self, payload: TaskPayload, auto_process: bool) -> Result<TaskRecord, TaskError> {
    let record = self.store.create(payload).await?;
    info!(task_id = %record.id, subject = %record.payload.subject, "task created");
    if !auto_process {
      return Ok(record);
    }
    self.scheduler.enqueue(&record.id).await?;
    self.store.get(&record.id).await
  }

  pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskSummary>, TaskError> {
    let reclaimed = self.scheduler.reclaim_stale().await?;
    if !reclaimed.is_empty() {
      info!(count = reclaimed.len(), "stale tasks reclaimed during listing");
    }

    let mut tasks: Vec<TaskRecord> = self
      .store
      .list_all()
      .await?
      .into_iter()
      .filter(|t| filter.subject.as_deref().is_none_or(|s| t.payload.subject == s))
      .filter(|t| {
        if filter.active_only {
          t.status.is_active()
        } else {
          filter.status.is_none_or(|s| t.status == s)
        }
      })
      .collect();
    tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(tasks.iter().map(TaskRecord::summary).collect())
  }

  pub async fn get(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError> {
    self.store.get(task_id).await
  }

  /// In the background: queue and return the current record. Otherwise run
  /// to the end and return the settled record.
  pub async fn process(&self, task_id: &TaskId, background: bool) -> Result<TaskRecord, TaskError> {
    if !background {
      return self.scheduler.run_foreground(task_id).await;
    }
    if self.scheduler.enqueue(task_id).await? == Enqueued::AlreadyInFlight {
      debug!(task_id = %task_id, "process requested for a task already in flight");
    }
    self.store.get(task_id).await
  }

  pub async fn retry(&self, task_id: &TaskId, background: bool) -> Result<TaskRecord, TaskError> {
    self.scheduler.retry(task_id, background).await
  }

  pub async fn cancel(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError> {
    self.scheduler.cancel(task_id).await
  }

  pub async fn delete(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError> {
    let record = self.store.get(task_id).await?;
    if record.status.is_active() {
      return Err(TaskError::conflict(task_id, "task is in progress; cancel or wait before deleting"));
    }
    let deleted = self.store.delete(task_id).await?;
    self.buffer.clear(task_id).await;
    self.scheduler.cancellations().remove(task_id);
    info!(task_id = %task_id, "task deleted");
    Ok(deleted)
  }

  /// The tail of the task's buffered model output. Zero means everything.
  pub async fn get_stream_snapshot(&self, task_id: &TaskId, max_chars: usize) -> Result<String, TaskError> {
    self.store.get(task_id).await?;
    let text = self.buffer.snapshot(task_id).await;
    Ok(tail_chars(&text, max_chars).to_owned())
  }

  /// A live feed for one task: a full snapshot first, then broker events,
  /// periodic progress snapshots when something changed and keepalives when
  /// idle. Ends with `done` once the task is terminal.
  pub fn subscribe_events(&self, task_id: TaskId) -> impl Stream<Item = StreamEvent> + Send + 'static + use<> {
    let service = self.clone();
    stream! {
      let mut mailbox = service.broker.subscribe(&task_id);
      let record = match service.store.get(&task_id).await {
        Ok(record) => record,
        Err(e) => {
          yield StreamEvent::Event(stream_error(&e));
          return;
        }
      };

      let mut last = ProgressSnapshot::from(&record);
      yield StreamEvent::Event(TaskEvent::Progress(last.clone()));
      let text = service.buffer.snapshot(&task_id).await;
      yield StreamEvent::Event(TaskEvent::LlmSnapshot { task_id: task_id.clone(), text });
      if record.status.is_terminal() {
        yield StreamEvent::Event(TaskEvent::Done);
        return;
      }

      let cfg = service.config.clone();
      let mut last_keepalive = Instant::now();
      let mut last_poll = Instant::now();
      loop {
        if let Some(event) = mailbox.recv_timeout(cfg.mailbox_poll).await {
          let terminal = matches!(&event, TaskEvent::Progress(p) if p.status.is_terminal());
          if let TaskEvent::Progress(p) = &event {
            last = p.clone();
          }
          yield StreamEvent::Event(event);
          if terminal {
            match service.store.get(&task_id).await {
              Ok(record) if record.status.is_terminal() => {
                yield StreamEvent::Event(TaskEvent::Done);
                return;
              }
              Ok(_) => {}
              Err(e) => {
                yield StreamEvent::Event(stream_error(&e));
                return;
              }
            }
          }
        }

        if last_keepalive.elapsed() >= cfg.keepalive_interval {
          last_keepalive = Instant::now();
          yield StreamEvent::KeepAlive;
        }

        if last_poll.elapsed() >= cfg.snapshot_interval {
          last_poll = Instant::now();
          let record = match service.store.get(&task_id).await {
            Ok(record) => record,
            Err(e) => {
              yield StreamEvent::Event(stream_error(&e));
              return;
            }
          };
          let record = match service.scheduler.reclaim_if_stale(&record).await {
            Ok(Some(reclaimed)) => reclaimed,
            Ok(None) => record,
            Err(e) => {
              warn!(task_id = %task_id, error = %e, "stale check failed");
              record
            }
          };
          let snapshot = ProgressSnapshot::from(&record);
          if snapshot != last {
            last = snapshot.clone();
            yield StreamEvent::Event(TaskEvent::Progress(snapshot));
          }
          if record.status.is_terminal() {
            yield StreamEvent::Event(TaskEvent::Done);
            return;
          }
        }
      }
    }
  }

  /// Re-solves and re-tags one problem, replacing its solution and tags.
  pub async fn retry_item(&self, task_id: &TaskId, problem_id: &str) -> Result<TaskRecord, TaskError> {
    let record = self.store.get(task_id).await?;
    let problem = record.problem(problem_id).cloned().ok_or_else(|| item_not_found(task_id, problem_id))?;

    let (solution, tags) = self
      .pipeline
      .solve_item(&record.payload, &problem)
      .await
      .map_err(|e| pipeline_failure(task_id, e))?;

    let (task, item) = (task_id.clone(), problem_id.to_owned());
    let updated = self
      .store
      .update(
        task_id,
        Box::new(move |r| {
          if r.problem(&item).is_none() {
            return Err(item_not_found(&task, &item));
          }
          r.solutions.retain(|s| s.problem_id != item);
          r.solutions.push(solution);
          r.tags.retain(|t| t.problem_id != item);
          r.tags.push(tags);
          Ok(())
        }),
      )
      .await?;
    info!(task_id = %task_id, problem_id, "problem re-solved");
    Ok(updated)
  }

  /// Re-tags one problem. Problems with locked tags are left alone unless
  /// `force` is set.
  pub async fn retag_item(&self, task_id: &TaskId, problem_id: &str, force: bool) -> Result<TaskRecord, TaskError> {
    let record = self.store.get(task_id).await?;
    let problem = record.problem(problem_id).ok_or_else(|| item_not_found(task_id, problem_id))?;
    if problem.locked_tags && !force {
      debug!(task_id = %task_id, problem_id, "tags locked, skipping retag");
      return Ok(record);
    }

    let tags = self
      .pipeline
      .tag_item(&record.payload, problem, record.solution(problem_id))
      .await
      .map_err(|e| pipeline_failure(task_id, e))?;
    self.replace_tags(task_id, problem_id, tags).await
  }

  /// Applies user corrections to one problem. Explicit tag fields edit the
  /// problem's tag set; otherwise `retag` asks the pipeline for fresh tags.
  pub async fn override_item(
    &self,
    task_id: &TaskId,
    problem_id: &str,
    patch: ProblemOverride,
  ) -> Result<TaskRecord, TaskError> {
    let record = self.store.get(task_id).await?;
    let mut problem = record.problem(problem_id).cloned().ok_or_else(|| item_not_found(task_id, problem_id))?;
    patch.apply_to_problem(&mut problem);

    let tags = if patch.touches_tags() {
      let mut tags = record.tag_set(problem_id).cloned().unwrap_or_default();
      tags.problem_id = problem_id.to_owned();
      patch.apply_to_tags(&mut tags);
      Some(tags)
    } else if patch.retag {
      let tags = self
        .pipeline
        .tag_item(&record.payload, &problem, record.solution(problem_id))
        .await
        .map_err(|e| pipeline_failure(task_id, e))?;
      Some(tags)
    } else {
      None
    };

    let (task, item) = (task_id.clone(), problem_id.to_owned());
    let updated = self
      .store
      .update(
        task_id,
        Box::new(move |r| {
          let slot = r
            .problems
            .iter_mut()
            .find(|p| p.problem_id == item)
            .ok_or_else(|| item_not_found(&task, &item))?;
          *slot = problem;
          if let Some(tags) = tags {
            r.tags.retain(|t| t.problem_id != item);
            r.tags.push(tags);
          }
          Ok(())
        }),
      )
      .await?;
    info!(task_id = %task_id, problem_id, "problem overridden");
    Ok(updated)
  }

  pub async fn delete_item(&self, task_id: &TaskId, problem_id: &str) -> Result<TaskRecord, TaskError> {
    let (task, item) = (task_id.clone(), problem_id.to_owned());
    let updated = self
      .store
      .update(
        task_id,
        Box::new(move |r| {
          if r.problem(&item).is_none() {
            return Err(item_not_found(&task, &item));
          }
          r.problems.retain(|p| p.problem_id != item);
          r.solutions.retain(|s| s.problem_id != item);
          r.tags.retain(|t| t.problem_id != item);
          Ok(())
        }),
      )
      .await?;
    info!(task_id = %task_id, problem_id, "problem deleted");
    Ok(updated)
  }

  /// Every problem across tasks, with manual and generated knowledge tags
  /// merged. `tag` keeps only problems carrying that exact tag.
  pub async fn list_items(&self, subject: Option<&str>, tag: Option<&str>) -> Result<Vec<ProblemSummary>, TaskError> {
    let mut tasks = self.store.list_all().await?;
    tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let mut items = Vec::new();
    for task in tasks.iter().filter(|t| subject.is_none_or(|s| t.payload.subject == s)) {
      for problem in &task.problems {
        let generated = task.tag_set(&problem.problem_id);
        let knowledge_points = merge_unique(
          &problem.knowledge_tags,
          generated.map(|t| t.knowledge_points.as_slice()).unwrap_or_default(),
        );
        if tag.is_some_and(|tag| !knowledge_points.iter().any(|k| k == tag)) {
          continue;
        }
        items.push(ProblemSummary {
          task_id: task.id.clone(),
          problem_id: problem.problem_id.clone(),
          question_no: problem.question_no.clone(),
          question_type: problem.question_type.clone().or_else(|| generated.map(|t| t.question_type.clone())),
          problem_text: problem.problem_text.clone(),
          subject: task.payload.subject.clone(),
          grade: task.payload.grade.clone(),
          source: problem.source.clone(),
          knowledge_points,
          knowledge_tags: problem.knowledge_tags.clone(),
          error_tags: problem.error_tags.clone(),
          user_tags: problem.user_tags.clone(),
        });
      }
    }
    Ok(items)
  }

  async fn replace_tags(
    &self,
    task_id: &TaskId,
    problem_id: &str,
    tags: TagSet,
  ) -> Result<TaskRecord, TaskError> {
    let (task, item) = (task_id.clone(), problem_id.to_owned());
    self
      .store
      .update(
        task_id,
        Box::new(move |r| {
          if r.problem(&item).is_none() {
            return Err(item_not_found(&task, &item));
          }
          r.tags.retain(|t| t.problem_id != item);
          r.tags.push(tags);
          Ok(())
        }),
      )
      .await
  }
}

fn item_not_found(task_id: &TaskId, problem_id: &str) -> TaskError {
  TaskError::ItemNotFound {
    task_id: task_id.clone(),
    item_id: problem_id.to_owned(),
  }
}

fn pipeline_failure(task_id: &TaskId, err: anyhow::Error) -> TaskError {
  TaskError::PipelineFailure {
    task_id: task_id.clone(),
    message: format!("{err:#}"),
  }
}

fn stream_error(err: &TaskError) -> TaskEvent {
  let error = match err {
    TaskError::NotFound { .. } => "not_found".to_owned(),
    other => other.to_string(),
  };
  TaskEvent::Error { error }
}
