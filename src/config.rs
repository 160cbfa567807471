use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
  pub server_port: u16,
  pub worker_count: usize,
  /// Zero means unbounded.
  pub queue_capacity: usize,
  pub stale_after: Duration,
  pub stream_cache_max_chars: usize,
  pub persist_tasks: bool,
  pub tasks_dir: PathBuf,
  pub stream_dir: PathBuf,
  pub autostart_workers: bool,
  pub worker_pop_timeout: Duration,
  pub mailbox_capacity: usize,
  pub mailbox_poll: Duration,
  pub snapshot_interval: Duration,
  pub keepalive_interval: Duration,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      server_port: 8080,
      worker_count: 2,
      queue_capacity: 1000,
      stale_after: Duration::from_secs(600),
      stream_cache_max_chars: 200_000,
      persist_tasks: true,
      tasks_dir: PathBuf::from("storage/tasks"),
      stream_dir: PathBuf::from("storage/task_streams"),
      autostart_workers: true,
      worker_pop_timeout: Duration::from_millis(500),
      mailbox_capacity: 1000,
      mailbox_poll: Duration::from_millis(500),
      snapshot_interval: Duration::from_secs(1),
      keepalive_interval: Duration::from_secs(10),
    }
  }
}

impl Config {
  pub fn from_env() -> Self {
    let defaults = Self::default();
    Self {
      server_port: env_or("SERVER_PORT", defaults.server_port),
      worker_count: env_or("TASK_WORKERS", defaults.worker_count).max(1),
      queue_capacity: env_or("TASK_QUEUE_MAXSIZE", defaults.queue_capacity),
      stale_after: Duration::from_secs(env_or("TASK_STALE_SECONDS", defaults.stale_after.as_secs())),
      stream_cache_max_chars: env_or("TASK_STREAM_CACHE_MAX_CHARS", defaults.stream_cache_max_chars),
      persist_tasks: env_flag("PERSIST_TASKS", defaults.persist_tasks),
      tasks_dir: env::var("TASKS_DIR").map(PathBuf::from).unwrap_or(defaults.tasks_dir),
      stream_dir: env::var("TASK_STREAM_DIR").map(PathBuf::from).unwrap_or(defaults.stream_dir),
      autostart_workers: env_flag("TASK_AUTOSTART_WORKERS", defaults.autostart_workers),
      ..defaults
    }
  }

  /// Memory-only configuration with workers left stopped; tests start them explicitly.
  pub fn for_tests() -> Self {
    Self {
      persist_tasks: false,
      autostart_workers: false,
      worker_pop_timeout: Duration::from_millis(50),
      mailbox_poll: Duration::from_millis(50),
      snapshot_interval: Duration::from_millis(100),
      ..Self::default()
    }
  }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
  env::var(name)
    .ok()
    .and_then(|v| v.trim().parse().ok())
    .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
  match env::var(name) {
    Ok(v) => parse_flag(&v).unwrap_or(default),
    Err(_) => default,
  }
}

fn parse_flag(value: &str) -> Option<bool> {
  match value.trim().to_ascii_lowercase().as_str() {
    "1" | "true" | "yes" | "on" => Some(true),
    "0" | "false" | "no" | "off" => Some(false),
    _ => None,
  }
}
