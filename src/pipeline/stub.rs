use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use super::Pipeline;
use crate::models::{ArchiveRecord, PipelineResult, Problem, Solution, TagSet, TaskPayload, TaskRecord};
use crate::parser::parse_structured;
use crate::worker_processing::PipelineContext;

const MAX_PROBLEMS: usize = 20;

/// Deterministic stand-in for a model-backed pipeline. Every problem gets a
/// canned reply that is streamed in chunks and then run through the
/// resilient parser, the same path real model output takes.
#[derive(Debug, Clone)]
pub struct StubPipeline {
  chunk_chars: usize,
  chunk_delay: Duration,
}

impl Default for StubPipeline {
  fn default() -> Self {
    Self {
      chunk_chars: 24,
      chunk_delay: Duration::ZERO,
    }
  }
}

impl StubPipeline {
  /// Sleeps between streamed chunks, which makes runs long enough to cancel.
  pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
    self.chunk_delay = delay;
    self
  }

  fn extract(&self, task: &TaskRecord) -> Vec<Problem> {
    let count = task.payload.problem_count.unwrap_or(1).clamp(1, MAX_PROBLEMS);
    let prompt = task.payload.notes.as_deref().unwrap_or("Solve for x");
    (1..=count)
      .map(|n| Problem {
        problem_id: format!("p{n}"),
        question_no: match (&task.payload.question_no, count) {
          (Some(no), 1) => Some(no.clone()),
          _ => Some(n.to_string()),
        },
        question_type: Some("short_answer".into()),
        problem_text: format!("{prompt}: 2x = {n}"),
        source: task.payload.source.clone(),
        ..Problem::default()
      })
      .collect()
  }
}

/// The model's reply for a problem. The LaTeX is deliberately left with
/// single backslashes, as models tend to emit it.
pub fn canned_reply(seed: usize) -> String {
  format!(
    r#"{{"answer": "x = \frac{{{seed}}}{{2}}", "explanation": "Divide both sides of \(2x = {seed}\) by 2.", "short_answer": "{seed}/2"}}"#
  )
}

/// Builds a solution from raw model output, falling back to a placeholder
/// when nothing can be recovered.
pub fn solution_from_reply(problem_id: &str, reply: &str) -> Solution {
  match parse_structured(reply) {
    Ok(parsed) => Solution {
      problem_id: problem_id.to_owned(),
      answer: parsed.get_str("answer").unwrap_or_default().to_owned(),
      explanation: parsed.get_str("explanation").unwrap_or_default().to_owned(),
      short_answer: parsed.get_str("short_answer").map(str::to_owned),
      incomplete_fields: parsed.incomplete,
    },
    Err(e) => {
      warn!(problem_id, error = %e, "unusable model reply, storing placeholder");
      Solution {
        problem_id: problem_id.to_owned(),
        answer: String::new(),
        explanation: "the model reply could not be read; retry this problem".into(),
        short_answer: None,
        incomplete_fields: vec!["answer".into(), "explanation".into()],
      }
    }
  }
}

fn tags_for(payload: &TaskPayload, problem: &Problem, solution: Option<&Solution>) -> TagSet {
  let mut error_hypothesis = Vec::new();
  if solution.is_some_and(|s| !s.incomplete_fields.is_empty()) {
    error_hypothesis.push("incomplete worked solution".to_owned());
  }
  TagSet {
    problem_id: problem.problem_id.clone(),
    knowledge_points: vec![format!("{} fundamentals", payload.subject), "linear equations".into()],
    question_type: problem.question_type.clone().unwrap_or_else(|| "short_answer".into()),
    skills: vec!["calculation".into()],
    error_hypothesis,
    recommended_actions: vec!["rework the problem without notes".into()],
  }
}

fn seed_of(problem: &Problem) -> usize {
  problem
    .question_no
    .as_deref()
    .and_then(|no| no.trim().parse().ok())
    .unwrap_or(1)
}

#[async_trait]
impl Pipeline for StubPipeline {
  async fn run(&self, task: &TaskRecord, ctx: &PipelineContext) -> anyhow::Result<PipelineResult> {
    ctx.progress("extracting", "reading the submission").await?;
    let problems = self.extract(task);
    let total = problems.len();

    let mut solutions = Vec::with_capacity(total);
    for (i, problem) in problems.iter().enumerate() {
      ctx.ensure_not_cancelled()?;
      ctx.progress("solving", format!("solving problem {}/{total}", i + 1)).await?;

      let reply = canned_reply(seed_of(problem));
      let chars: Vec<char> = reply.chars().collect();
      for chunk in chars.chunks(self.chunk_chars.max(1)) {
        let chunk: String = chunk.iter().collect();
        ctx.delta(&problem.problem_id, "solution", &chunk).await?;
        if !self.chunk_delay.is_zero() {
          tokio::time::sleep(self.chunk_delay).await;
        }
      }
      solutions.push(solution_from_reply(&problem.problem_id, &reply));
    }

    ctx.progress("tagging", format!("tagging {total} problems")).await?;
    let tags = problems
      .iter()
      .zip(&solutions)
      .map(|(problem, solution)| tags_for(&task.payload, problem, Some(solution)))
      .collect();

    ctx.progress("archiving", "storing results").await?;
    let archive = ArchiveRecord {
      task_id: task.id.clone(),
      stored_problem_ids: problems.iter().map(|p| p.problem_id.clone()).collect(),
      timestamp: Utc::now(),
    };

    Ok(PipelineResult {
      problems,
      solutions,
      tags,
      archive: Some(archive),
    })
  }

  async fn solve_item(&self, payload: &TaskPayload, problem: &Problem) -> anyhow::Result<(Solution, TagSet)> {
    let solution = solution_from_reply(&problem.problem_id, &canned_reply(seed_of(problem)));
    let tags = tags_for(payload, problem, Some(&solution));
    Ok((solution, tags))
  }

  async fn tag_item(
    &self,
    payload: &TaskPayload,
    problem: &Problem,
    solution: Option<&Solution>,
  ) -> anyhow::Result<TagSet> {
    Ok(tags_for(payload, problem, solution))
  }
}
