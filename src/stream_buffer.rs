use std::collections::HashMap;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::warn;

use crate::models::TaskId;

/// Accumulated model output per task, kept so a reconnecting client can
/// replay what it missed. The in-memory copy is capped to the last
/// `max_chars` characters; when a directory is configured every delta is
/// also appended to `<dir>/<task_id>.txt`.
#[derive(Debug)]
pub struct StreamBuffer {
  dir: Option<PathBuf>,
  max_chars: usize,
  cache: Mutex<HashMap<TaskId, String>>,
}

impl StreamBuffer {
  pub fn in_memory(max_chars: usize) -> Self {
    Self {
      dir: None,
      max_chars,
      cache: Mutex::new(HashMap::new()),
    }
  }

  pub fn persistent(dir: impl Into<PathBuf>, max_chars: usize) -> Self {
    Self {
      dir: Some(dir.into()),
      max_chars,
      cache: Mutex::new(HashMap::new()),
    }
  }

  fn path(&self, task_id: &TaskId) -> Option<PathBuf> {
    if !task_id.is_well_formed() {
      return None;
    }
    self.dir.as_ref().map(|dir| dir.join(format!("{task_id}.txt")))
  }

  pub async fn append(&self, task_id: &TaskId, delta: &str) {
    if delta.is_empty() {
      return;
    }
    {
      let mut cache = self.cache.lock().await;
      let text = cache.entry(task_id.clone()).or_default();
      text.push_str(delta);
      truncate_front(text, self.max_chars);
    }

    // The file write happens unlocked; a task's deltas come from its one owner, in order.
    if let Some(path) = self.path(task_id) {
      if let Err(e) = append_file(&path, delta).await {
        warn!(task_id = %task_id, error = %e, "failed to persist stream delta");
      }
    }
  }

  /// The buffered text, loading the tail of the sibling file after a restart.
  pub async fn snapshot(&self, task_id: &TaskId) -> String {
    let mut cache = self.cache.lock().await;
    if let Some(text) = cache.get(task_id) {
      return text.clone();
    }
    let text = match self.path(task_id) {
      Some(path) => read_tail(&path, self.max_chars).await,
      None => String::new(),
    };
    cache.insert(task_id.clone(), text.clone());
    text
  }

  pub async fn clear(&self, task_id: &TaskId) {
    self.cache.lock().await.remove(task_id);
    if let Some(path) = self.path(task_id) {
      match fs::remove_file(&path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(task_id = %task_id, error = %e, "failed to remove stream file"),
      }
    }
  }
}

async fn append_file(path: &Path, delta: &str) -> std::io::Result<()> {
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).await?;
  }
  let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
  file.write_all(delta.as_bytes()).await?;
  file.flush().await
}

async fn read_tail(path: &Path, max_chars: usize) -> String {
  if max_chars == 0 {
    return String::new();
  }
  let read = async {
    let mut file = fs::File::open(path).await?;
    let size = file.metadata().await?.len();
    let max_bytes = (max_chars as u64).saturating_mul(4);
    let start = size.saturating_sub(max_bytes);
    if start > 0 {
      file.seek(SeekFrom::Start(start)).await?;
    }
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).await?;
    Ok::<_, std::io::Error>(bytes)
  };
  match read.await {
    Ok(bytes) => {
      let decoded = String::from_utf8_lossy(&bytes);
      let mut text = decoded.trim_start_matches(char::REPLACEMENT_CHARACTER).to_owned();
      truncate_front(&mut text, max_chars);
      text
    }
    Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
    Err(e) => {
      warn!(path = %path.display(), error = %e, "failed to read stream file");
      String::new()
    }
  }
}

/// The last `max_chars` characters of `text`; zero means no limit.
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
  if max_chars == 0 {
    return text;
  }
  match text.char_indices().rev().nth(max_chars - 1) {
    Some((idx, _)) => &text[idx..],
    None => text,
  }
}

fn truncate_front(text: &mut String, max_chars: usize) {
  let keep_from = text.len() - tail_chars(text, max_chars).len();
  if keep_from > 0 {
    text.drain(..keep_from);
  }
}
