use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{Mutation, TaskStore, apply_mutation};
use crate::error::TaskError;
use crate::models::{TaskId, TaskRecord};

/// One pretty-printed JSON document per task, written via temp file + rename.
/// Records are cached in memory and written through on every change.
#[derive(Debug)]
pub struct FileTaskStore {
  base_dir: PathBuf,
  tasks: Mutex<HashMap<TaskId, TaskRecord>>,
}

impl FileTaskStore {
  /// Opens `base_dir`, creating it if needed, and loads every readable record.
  /// Corrupt or half-written files are skipped.
  pub async fn open(base_dir: impl Into<PathBuf>) -> Result<Self, TaskError> {
    let base_dir = base_dir.into();
    fs::create_dir_all(&base_dir).await?;

    let mut tasks = HashMap::new();
    let mut entries = fs::read_dir(&base_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
      let path = entry.path();
      if path.extension().and_then(|e| e.to_str()) != Some("json") {
        continue;
      }
      match load_record(&path).await {
        Ok(record) => {
          tasks.insert(record.id.clone(), record);
        }
        Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable task file"),
      }
    }
    info!(dir = %base_dir.display(), count = tasks.len(), "task store loaded");

    Ok(Self {
      base_dir,
      tasks: Mutex::new(tasks),
    })
  }

  pub fn base_dir(&self) -> &Path {
    &self.base_dir
  }

  fn task_path(&self, task_id: &TaskId) -> Result<PathBuf, TaskError> {
    if !task_id.is_well_formed() {
      return Err(TaskError::not_found(task_id));
    }
    Ok(self.base_dir.join(format!("{task_id}.json")))
  }

  async fn write(&self, record: &TaskRecord) -> Result<(), TaskError> {
    let path = self.task_path(&record.id)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(record)?).await?;
    fs::rename(&tmp, &path).await?;
    Ok(())
  }
}

async fn load_record(path: &Path) -> Result<TaskRecord, TaskError> {
  let raw = fs::read(path).await?;
  Ok(serde_json::from_slice(&raw)?)
}

#[async_trait]
impl TaskStore for FileTaskStore {
  async fn insert(&self, record: TaskRecord) -> Result<TaskRecord, TaskError> {
    let mut tasks = self.tasks.lock().await;
    self.write(&record).await?;
    tasks.insert(record.id.clone(), record.clone());
    Ok(record)
  }

  async fn get(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError> {
    self
      .tasks
      .lock()
      .await
      .get(task_id)
      .cloned()
      .ok_or_else(|| TaskError::not_found(task_id))
  }

  async fn list_all(&self) -> Result<Vec<TaskRecord>, TaskError> {
    Ok(self.tasks.lock().await.values().cloned().collect())
  }

  async fn update(&self, task_id: &TaskId, mutation: Mutation) -> Result<TaskRecord, TaskError> {
    let mut tasks = self.tasks.lock().await;
    let current = tasks.get(task_id).ok_or_else(|| TaskError::not_found(task_id))?;
    let next = apply_mutation(current, mutation)?;
    self.write(&next).await?;
    tasks.insert(task_id.clone(), next.clone());
    Ok(next)
  }

  async fn delete(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError> {
    let mut tasks = self.tasks.lock().await;
    if !tasks.contains_key(task_id) {
      return Err(TaskError::not_found(task_id));
    }
    match fs::remove_file(self.task_path(task_id)?).await {
      Ok(()) => {}
      Err(e) if e.kind() == ErrorKind::NotFound => {}
      Err(e) => return Err(e.into()),
    }
    tasks.remove(task_id).ok_or_else(|| TaskError::not_found(task_id))
  }
}
