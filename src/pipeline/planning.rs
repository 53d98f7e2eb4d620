//! Planning phase (`design`).

use tracing::{info, warn};

use crate::error::PipelineError;
use crate::pipeline::PhaseContext;
use crate::pipeline::prompts;
use crate::pipeline::types::ResearchPlan;
use crate::tasks::model::TaskStatus;
use crate::workspace::artifacts;

/// Produce and save the plan. An empty model answer ends the pipeline.
pub async fn run(ctx: &PhaseContext<'_>) -> Result<ResearchPlan, PipelineError> {
    ctx.progress(TaskStatus::Design, 10, "Planning").await?;

    let raw = ctx
        .generate(
            prompts::PLANNING_SYSTEM,
            prompts::planning_prompt(ctx.task),
            ctx.config().plan_tokens,
        )
        .await;
    if raw.trim().is_empty() {
        warn!(task_id = %ctx.task.id, "Planning produced no output");
        ctx.note("Planning failed: the model returned no plan").await;
        return Err(PipelineError::EmptyPlan);
    }

    let plan = ResearchPlan::parse(&raw);
    if plan.is_unstructured() {
        info!(task_id = %ctx.task.id, "Plan was not structured JSON; using free text");
    }
    ctx.save(artifacts::PLAN, &plan.to_markdown(&ctx.task.title))
        .await?;

    ctx.progress(TaskStatus::Design, 100, "Plan ready").await?;
    Ok(plan)
}
