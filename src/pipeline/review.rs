//! Review phase (`review`).
//!
//! One critique; if it asks for rework, one revision and one final
//! critique. The final critique never triggers another revision.

use tracing::{info, warn};

use crate::error::PipelineError;
use crate::pipeline::PhaseContext;
use crate::pipeline::execution::{render_secondary, write_primary};
use crate::pipeline::prompts;
use crate::pipeline::types::{ExecutionOutput, ResearchPlan, ResearchSummary, ReviewOutcome};
use crate::tasks::model::{TaskStatus, truncate_content};
use crate::workspace::artifacts;

/// Characters of a critique quoted in a progress message.
const CRITIQUE_PREVIEW_CHARS: usize = 500;

/// Review result and the artifact that survived it.
#[derive(Debug, Clone)]
pub struct ReviewResult {
    pub outcome: ReviewOutcome,
    pub output: ExecutionOutput,
}

/// True when `critique` contains any revision phrase (case-insensitive).
pub fn needs_revision(critique: &str, phrases: &[String]) -> bool {
    let lower = critique.to_lowercase();
    phrases
        .iter()
        .any(|phrase| lower.contains(&phrase.to_lowercase()))
}

pub async fn run(
    ctx: &PhaseContext<'_>,
    plan: &ResearchPlan,
    research: &ResearchSummary,
    output: ExecutionOutput,
) -> Result<ReviewResult, PipelineError> {
    ctx.progress(TaskStatus::Review, 0, "Reviewing output").await?;

    let critique = request_critique(ctx, plan, &output.content).await;
    if critique.trim().is_empty() {
        ctx.note("Review unavailable; accepting output as-is").await;
        ctx.progress(TaskStatus::Review, 100, "Review skipped").await?;
        return Ok(ReviewResult {
            outcome: ReviewOutcome::default(),
            output,
        });
    }

    ctx.save(artifacts::REVIEW, &critique).await?;
    ctx.progress(
        TaskStatus::Review,
        40,
        &format!("Review: {}", truncate_content(&critique, CRITIQUE_PREVIEW_CHARS)),
    )
    .await?;

    if !needs_revision(&critique, &ctx.config().revision_phrases) {
        ctx.progress(TaskStatus::Review, 100, "Review passed").await?;
        return Ok(ReviewResult {
            outcome: ReviewOutcome {
                critique,
                revised: false,
                final_critique: None,
            },
            output,
        });
    }

    info!(task_id = %ctx.task.id, "Review requested a revision");
    ctx.progress(TaskStatus::Review, 50, "Revising output").await?;

    let revised = ctx
        .generate(
            prompts::REVISION_SYSTEM,
            prompts::revision_prompt(ctx.task, plan, research, &output.content, &critique),
            ctx.config().artifact_tokens,
        )
        .await;
    if revised.trim().is_empty() {
        warn!(task_id = %ctx.task.id, "Revision produced no output");
        ctx.note("Revision failed; keeping the original output").await;
        ctx.progress(TaskStatus::Review, 100, "Review complete without revision")
            .await?;
        return Ok(ReviewResult {
            outcome: ReviewOutcome {
                critique,
                revised: false,
                final_critique: None,
            },
            output,
        });
    }

    let path = write_primary(ctx, &revised).await?;
    let secondary = render_secondary(ctx, &revised).await?;
    ctx.progress(TaskStatus::Review, 75, "Revision written").await?;

    let final_critique = request_critique(ctx, plan, &revised).await;
    if final_critique.trim().is_empty() {
        ctx.note("Final review unavailable").await;
    } else {
        ctx.save(artifacts::REVIEW_FINAL, &final_critique).await?;
    }
    ctx.progress(
        TaskStatus::Review,
        90,
        &format!(
            "Final review: {}",
            truncate_content(&final_critique, CRITIQUE_PREVIEW_CHARS)
        ),
    )
    .await?;
    ctx.progress(TaskStatus::Review, 100, "Review complete").await?;

    Ok(ReviewResult {
        outcome: ReviewOutcome {
            critique,
            revised: true,
            final_critique: Some(final_critique).filter(|c| !c.trim().is_empty()),
        },
        output: ExecutionOutput {
            content: revised,
            path,
            secondary,
        },
    })
}

async fn request_critique(ctx: &PhaseContext<'_>, plan: &ResearchPlan, artifact: &str) -> String {
    ctx.generate(
        prompts::CRITIQUE_SYSTEM,
        prompts::critique_prompt(ctx.task, plan, artifact),
        ctx.config().critique_tokens,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;

    #[test]
    fn revision_phrases_match_case_insensitively() {
        let phrases = PipelineConfig::default().revision_phrases;
        assert!(needs_revision("Verdict: MAJOR REVISIONS required.", &phrases));
        assert!(needs_revision("The draft does not meet the criteria", &phrases));
        assert!(!needs_revision("Acceptable. Minor typos only.", &phrases));
    }
}
