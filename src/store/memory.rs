use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Mutation, TaskStore, apply_mutation};
use crate::error::TaskError;
use crate::models::{TaskId, TaskRecord};

/// Non-persistent store; everything is lost with the process.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
  tasks: RwLock<HashMap<TaskId, TaskRecord>>,
}

impl MemoryTaskStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
  async fn insert(&self, record: TaskRecord) -> Result<TaskRecord, TaskError> {
    self.tasks.write().await.insert(record.id.clone(), record.clone());
    Ok(record)
  }

  async fn get(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError> {
    self
      .tasks
      .read()
      .await
      .get(task_id)
      .cloned()
      .ok_or_else(|| TaskError::not_found(task_id))
  }

  async fn list_all(&self) -> Result<Vec<TaskRecord>, TaskError> {
    Ok(self.tasks.read().await.values().cloned().collect())
  }

  async fn update(&self, task_id: &TaskId, mutation: Mutation) -> Result<TaskRecord, TaskError> {
    let mut tasks = self.tasks.write().await;
    let current = tasks.get(task_id).ok_or_else(|| TaskError::not_found(task_id))?;
    let next = apply_mutation(current, mutation)?;
    tasks.insert(task_id.clone(), next.clone());
    Ok(next)
  }

  async fn delete(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError> {
    self
      .tasks
      .write()
      .await
      .remove(task_id)
      .ok_or_else(|| TaskError::not_found(task_id))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::TaskPayload;
  use crate::store::TaskStoreExt;

  #[tokio::test]
  async fn crud_round_trip() {
    let store = MemoryTaskStore::new();
    let task = store.create(TaskPayload::with_subject("physics")).await.unwrap();
    assert_eq!(store.get(&task.id).await.unwrap().payload.subject, "physics");
    assert_eq!(store.list_all().await.unwrap().len(), 1);

    store.delete(&task.id).await.unwrap();
    assert!(matches!(store.get(&task.id).await, Err(TaskError::NotFound { .. })));
    assert!(matches!(store.delete(&task.id).await, Err(TaskError::NotFound { .. })));
  }

  #[tokio::test]
  async fn concurrent_patches_are_not_lost() {
    let store = std::sync::Arc::new(MemoryTaskStore::new());
    let task = store.create(TaskPayload::default()).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..16 {
      let store = store.clone();
      let id = task.id.clone();
      handles.push(tokio::spawn(async move {
        store
          .update(
            &id,
            Box::new(move |r| {
              r.payload.user_tags.push(format!("tag-{i}"));
              Ok(())
            }),
          )
          .await
      }));
    }
    for handle in handles {
      handle.await.unwrap().unwrap();
    }
    assert_eq!(store.get(&task.id).await.unwrap().payload.user_tags.len(), 16);
  }
}
