use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lifecycle::TaskStatus;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
  pub fn new() -> Self {
    Self(Uuid::new_v4().simple().to_string())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Ids double as file names in the file-backed store, so anything outside
  /// `[0-9A-Za-z_-]` can never name a task.
  pub fn is_well_formed(&self) -> bool {
    !self.0.is_empty()
      && self.0.len() <= 64
      && self.0.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
  }
}

impl Default for TaskId {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for TaskId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for TaskId {
  fn from(s: &str) -> Self {
    Self(s.to_owned())
  }
}

impl From<String> for TaskId {
  fn from(s: String) -> Self {
    Self(s)
  }
}

fn default_subject() -> String {
  "math".into()
}

/// The immutable description of the work. Only `subject` and the manual
/// tag fields mean anything to the core; the rest is handed to the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
  #[serde(default = "default_subject")]
  pub subject: String,
  #[serde(default)]
  pub grade: Option<String>,
  #[serde(default)]
  pub notes: Option<String>,
  #[serde(default)]
  pub question_no: Option<String>,
  #[serde(default)]
  pub source: Option<String>,
  #[serde(default)]
  pub problem_count: Option<usize>,
  #[serde(default)]
  pub knowledge_tags: Vec<String>,
  #[serde(default)]
  pub error_tags: Vec<String>,
  #[serde(default)]
  pub user_tags: Vec<String>,
  #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
  pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskPayload {
  pub fn with_subject(subject: impl Into<String>) -> Self {
    Self {
      subject: subject.into(),
      ..Self::default()
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Problem {
  pub problem_id: String,
  #[serde(default)]
  pub question_no: Option<String>,
  #[serde(default)]
  pub question_type: Option<String>,
  pub problem_text: String,
  #[serde(default)]
  pub source: Option<String>,
  #[serde(default)]
  pub locked_tags: bool,
  #[serde(default)]
  pub knowledge_tags: Vec<String>,
  #[serde(default)]
  pub error_tags: Vec<String>,
  #[serde(default)]
  pub user_tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Solution {
  pub problem_id: String,
  pub answer: String,
  pub explanation: String,
  #[serde(default)]
  pub short_answer: Option<String>,
  /// Fields the model output only partially delivered.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub incomplete_fields: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagSet {
  pub problem_id: String,
  #[serde(default)]
  pub knowledge_points: Vec<String>,
  #[serde(default)]
  pub question_type: String,
  #[serde(default)]
  pub skills: Vec<String>,
  #[serde(default)]
  pub error_hypothesis: Vec<String>,
  #[serde(default)]
  pub recommended_actions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRecord {
  pub task_id: TaskId,
  pub stored_problem_ids: Vec<String>,
  pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
  pub problems: Vec<Problem>,
  pub solutions: Vec<Solution>,
  pub tags: Vec<TagSet>,
  pub archive: Option<ArchiveRecord>,
}

impl PipelineResult {
  /// Folds the user-supplied payload fields into what the pipeline produced.
  pub fn merge_manual_fields(mut self, payload: &TaskPayload) -> Self {
    let source = payload.source.as_deref().map(str::trim).unwrap_or_default();
    if !source.is_empty() {
      for problem in &mut self.problems {
        if problem.source.as_deref().is_none_or(|s| s.trim().is_empty()) {
          problem.source = Some(source.to_owned());
        }
      }
    }

    if !payload.knowledge_tags.is_empty() || !payload.error_tags.is_empty() {
      for tags in &mut self.tags {
        tags.knowledge_points = merge_unique(&payload.knowledge_tags, &tags.knowledge_points);
        tags.error_hypothesis = merge_unique(&payload.error_tags, &tags.error_hypothesis);
      }
    }
    self
  }
}

/// Trimmed, case-insensitively de-duplicated concatenation; blanks are dropped.
pub fn merge_unique(prefix: &[String], tail: &[String]) -> Vec<String> {
  let mut seen = HashSet::new();
  prefix
    .iter()
    .chain(tail)
    .map(|s| s.trim())
    .filter(|s| !s.is_empty())
    .filter(|s| seen.insert(s.to_lowercase()))
    .map(str::to_owned)
    .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
  pub id: TaskId,
  pub payload: TaskPayload,
  pub status: TaskStatus,
  #[serde(default)]
  pub stage: Option<String>,
  #[serde(default)]
  pub stage_message: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  #[serde(default)]
  pub last_error: Option<String>,
  #[serde(default)]
  pub problems: Vec<Problem>,
  #[serde(default)]
  pub solutions: Vec<Solution>,
  #[serde(default)]
  pub tags: Vec<TagSet>,
  #[serde(default)]
  pub archive: Option<ArchiveRecord>,
}

impl TaskRecord {
  pub fn new(payload: TaskPayload) -> Self {
    let now = Utc::now();
    Self {
      id: TaskId::new(),
      payload,
      status: TaskStatus::Pending,
      stage: None,
      stage_message: None,
      created_at: now,
      updated_at: now,
      last_error: None,
      problems: Vec::new(),
      solutions: Vec::new(),
      tags: Vec::new(),
      archive: None,
    }
  }

  pub fn problem(&self, problem_id: &str) -> Option<&Problem> {
    self.problems.iter().find(|p| p.problem_id == problem_id)
  }

  pub fn solution(&self, problem_id: &str) -> Option<&Solution> {
    self.solutions.iter().find(|s| s.problem_id == problem_id)
  }

  pub fn tag_set(&self, problem_id: &str) -> Option<&TagSet> {
    self.tags.iter().find(|t| t.problem_id == problem_id)
  }

  pub fn summary(&self) -> TaskSummary {
    TaskSummary {
      id: self.id.clone(),
      status: self.status,
      stage: self.stage.clone(),
      stage_message: self.stage_message.clone(),
      created_at: self.created_at,
      updated_at: self.updated_at,
      subject: self.payload.subject.clone(),
      question_no: self.payload.question_no.clone(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
  pub id: TaskId,
  pub status: TaskStatus,
  pub stage: Option<String>,
  pub stage_message: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub subject: String,
  pub question_no: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFilter {
  #[serde(default)]
  pub status: Option<TaskStatus>,
  #[serde(default)]
  pub active_only: bool,
  #[serde(default)]
  pub subject: Option<String>,
}

/// One problem flattened out of its task, for library views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemSummary {
  pub task_id: TaskId,
  pub problem_id: String,
  pub question_no: Option<String>,
  pub question_type: Option<String>,
  pub problem_text: String,
  pub subject: String,
  pub grade: Option<String>,
  pub source: Option<String>,
  pub knowledge_points: Vec<String>,
  pub knowledge_tags: Vec<String>,
  pub error_tags: Vec<String>,
  pub user_tags: Vec<String>,
}

/// User corrections for a single problem. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProblemOverride {
  pub question_no: Option<String>,
  pub question_type: Option<String>,
  pub problem_text: Option<String>,
  pub source: Option<String>,
  pub locked_tags: Option<bool>,
  pub knowledge_tags: Option<Vec<String>>,
  pub error_tags: Option<Vec<String>>,
  pub user_tags: Option<Vec<String>>,
  pub knowledge_points: Option<Vec<String>>,
  pub skills: Option<Vec<String>>,
  pub error_hypothesis: Option<Vec<String>>,
  pub recommended_actions: Option<Vec<String>>,
  pub retag: bool,
}

impl ProblemOverride {
  pub fn touches_tags(&self) -> bool {
    self.knowledge_points.is_some()
      || self.question_type.is_some()
      || self.skills.is_some()
      || self.error_hypothesis.is_some()
      || self.recommended_actions.is_some()
  }

  pub fn apply_to_problem(&self, problem: &mut Problem) {
    if let Some(v) = &self.question_no {
      problem.question_no = Some(v.clone());
    }
    if let Some(v) = &self.question_type {
      problem.question_type = Some(v.clone());
    }
    if let Some(v) = self.problem_text.as_ref().filter(|t| !t.trim().is_empty()) {
      problem.problem_text = v.clone();
    }
    if let Some(v) = &self.source {
      problem.source = Some(v.clone());
    }
    if let Some(v) = self.locked_tags {
      problem.locked_tags = v;
    }
    if let Some(v) = &self.knowledge_tags {
      problem.knowledge_tags = v.clone();
    }
    if let Some(v) = &self.error_tags {
      problem.error_tags = v.clone();
    }
    if let Some(v) = &self.user_tags {
      problem.user_tags = v.clone();
    }
  }

  pub fn apply_to_tags(&self, tags: &mut TagSet) {
    if let Some(v) = &self.knowledge_points {
      tags.knowledge_points = v.clone();
    }
    if let Some(v) = &self.question_type {
      tags.question_type = v.clone();
    }
    if let Some(v) = &self.skills {
      tags.skills = v.clone();
    }
    if let Some(v) = &self.error_hypothesis {
      tags.error_hypothesis = v.clone();
    }
    if let Some(v) = &self.recommended_actions {
      tags.recommended_actions = v.clone();
    }
  }
}
