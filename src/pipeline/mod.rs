//! Four-phase task pipeline.
//!
//! Every assigned task flows through:
//! 1. `planning` (design): structured plan from title and description
//! 2. `research_phase` (build): search queries, per-query summaries, synthesis
//! 3. `execution` (test): the primary artifact plus secondary formats
//! 4. `review` (review): critique, at most one revision, final critique
//!
//! Each phase enters its stage at progress 0 and leaves it at 100. A phase
//! error ends the run; the scheduler then resets the task.

pub mod execution;
pub mod planning;
pub mod prompts;
pub mod render;
pub mod research_phase;
pub mod review;
pub mod types;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::llm::{GenerateRequest, LlmGateway};
use crate::research::ResearchClient;
use crate::store::Database;
use crate::tasks::model::{Agent, Task, TaskStatus};
use crate::workspace::Workspace;

pub use render::{BasicRenderer, FormatRenderer};
pub use types::{PipelineReport, ResearchPlan, ResearchSummary};

/// Collaborators shared by all phases.
#[derive(Clone)]
pub struct PipelineDeps {
    pub store: Arc<dyn Database>,
    pub gateway: LlmGateway,
    pub research: Arc<dyn ResearchClient>,
    pub workspace: Workspace,
    pub renderer: Arc<dyn FormatRenderer>,
    pub config: PipelineConfig,
}

/// Per-run handle passed to each phase.
pub struct PhaseContext<'a> {
    pub deps: &'a PipelineDeps,
    pub task: &'a Task,
    pub agent: &'a Agent,
}

impl PhaseContext<'_> {
    /// Report stage and progress.
    ///
    /// Fails with `Superseded` when the store no longer considers this agent
    /// the owner, which happens after a reclaim or reset.
    pub async fn progress(
        &self,
        status: TaskStatus,
        progress: u8,
        message: &str,
    ) -> Result<(), PipelineError> {
        let updated = self
            .deps
            .store
            .update_task_status(self.task.id, status, progress, message, Some(self.agent.id))
            .await?;
        if !updated {
            return Err(PipelineError::Superseded {
                task_id: self.task.id,
            });
        }
        Ok(())
    }

    /// Best-effort informational note.
    pub async fn note(&self, message: &str) {
        if let Err(e) = self
            .deps
            .store
            .record_note(self.task.id, Some(self.agent.id), message)
            .await
        {
            warn!(task_id = %self.task.id, error = %e, "Failed to record note");
        }
    }

    /// Generate with the agent's model. Empty on failure.
    pub async fn generate(&self, system: &str, prompt: String, max_tokens: u32) -> String {
        let request = GenerateRequest::new(&self.agent.model, prompt)
            .with_system(system)
            .with_max_tokens(max_tokens);
        self.deps.gateway.generate(&request).await
    }

    /// Write an artifact into the task's directory.
    pub async fn save(&self, filename: &str, content: &str) -> Result<PathBuf, PipelineError> {
        Ok(self
            .deps
            .workspace
            .save_artifact(self.task.id, filename, content)
            .await?)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.deps.config
    }
}

/// Runs the four phases in order for one task.
#[derive(Clone)]
pub struct PhasePipeline {
    deps: Arc<PipelineDeps>,
}

impl PhasePipeline {
    pub fn new(deps: PipelineDeps) -> Self {
        Self {
            deps: Arc::new(deps),
        }
    }

    pub fn deps(&self) -> &PipelineDeps {
        &self.deps
    }

    /// Drive `task` from design to complete.
    pub async fn run(&self, task: &Task, agent: &Agent) -> Result<PipelineReport, PipelineError> {
        let ctx = PhaseContext {
            deps: &self.deps,
            task,
            agent,
        };
        info!(task_id = %task.id, agent = %agent.name, model = %agent.model, "Pipeline started");

        let plan = planning::run(&ctx).await?;
        let research = research_phase::run(&ctx, &plan).await?;
        let output = execution::run(&ctx, &plan, &research).await?;
        let review = review::run(&ctx, &plan, &research, output).await?;

        ctx.progress(TaskStatus::Complete, 100, "Task complete").await?;
        info!(
            task_id = %task.id,
            revised = review.outcome.revised,
            queries_succeeded = research.succeeded_count(),
            "Pipeline complete"
        );

        Ok(PipelineReport {
            task_id: task.id,
            output_path: review.output.path,
            secondary_paths: review.output.secondary,
            queries_total: research.outcomes.len(),
            queries_succeeded: research.succeeded_count(),
            revised: review.outcome.revised,
        })
    }
}
