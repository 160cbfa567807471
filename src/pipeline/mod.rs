//! The external work a task runs: extracting problems from the payload,
//! solving and tagging them. The scheduler only knows this trait.

use async_trait::async_trait;

use crate::models::{PipelineResult, Problem, Solution, TagSet, TaskPayload, TaskRecord};
use crate::worker_processing::PipelineContext;

pub mod stub;

pub use stub::StubPipeline;

#[async_trait]
pub trait Pipeline: Send + Sync + 'static {
  /// Runs the whole task. Implementations report through `ctx` and should
  /// propagate its [`Cancelled`](crate::error::Cancelled) errors with `?`.
  async fn run(&self, task: &TaskRecord, ctx: &PipelineContext) -> anyhow::Result<PipelineResult>;

  /// Solves and tags a single problem outside a task run.
  async fn solve_item(&self, payload: &TaskPayload, problem: &Problem) -> anyhow::Result<(Solution, TagSet)>;

  async fn tag_item(
    &self,
    payload: &TaskPayload,
    problem: &Problem,
    solution: Option<&Solution>,
  ) -> anyhow::Result<TagSet>;
}
