//! Execution phase (`test`).

use std::path::PathBuf;

use tracing::warn;

use crate::error::PipelineError;
use crate::pipeline::PhaseContext;
use crate::pipeline::prompts;
use crate::pipeline::types::{ExecutionOutput, ResearchPlan, ResearchSummary};
use crate::tasks::model::{OutputFormat, TaskStatus};
use crate::workspace::artifacts;

/// File name of the artifact in `format`.
pub fn output_filename(format: OutputFormat) -> String {
    format!("{}.{}", artifacts::OUTPUT_STEM, format.extension())
}

/// Generate the primary artifact and any requested secondary formats.
///
/// An empty artifact ends the pipeline; plan and research stay on disk.
pub async fn run(
    ctx: &PhaseContext<'_>,
    plan: &ResearchPlan,
    research: &ResearchSummary,
) -> Result<ExecutionOutput, PipelineError> {
    ctx.progress(TaskStatus::Test, 0, "Generating output").await?;

    let content = ctx
        .generate(
            prompts::EXECUTION_SYSTEM,
            prompts::execution_prompt(ctx.task, plan, research),
            ctx.config().artifact_tokens,
        )
        .await;
    if content.trim().is_empty() {
        warn!(task_id = %ctx.task.id, "Execution produced no output");
        ctx.note("Execution failed: the model returned no document; plan and research were kept")
            .await;
        return Err(PipelineError::EmptyArtifact);
    }

    let path = write_primary(ctx, &content).await?;
    ctx.progress(TaskStatus::Test, 70, "Primary output written").await?;

    let secondary = render_secondary(ctx, &content).await?;
    ctx.progress(TaskStatus::Test, 100, "Output ready").await?;

    Ok(ExecutionOutput {
        content,
        path,
        secondary,
    })
}

/// Save the markdown artifact and record it as the task's result.
pub(crate) async fn write_primary(
    ctx: &PhaseContext<'_>,
    content: &str,
) -> Result<PathBuf, PipelineError> {
    let path = ctx
        .save(&output_filename(OutputFormat::Markdown), content)
        .await?;
    ctx.deps
        .store
        .set_result_path(ctx.task.id, &path.to_string_lossy())
        .await?;
    Ok(path)
}

/// Convert to every requested secondary format. A conversion failure is
/// noted and skipped.
pub(crate) async fn render_secondary(
    ctx: &PhaseContext<'_>,
    content: &str,
) -> Result<Vec<PathBuf>, PipelineError> {
    let mut paths = Vec::new();
    for format in ctx.task.secondary_formats() {
        match ctx.deps.renderer.render(content, format) {
            Ok(rendered) => {
                paths.push(ctx.save(&output_filename(format), &rendered).await?);
            }
            Err(e) => {
                warn!(task_id = %ctx.task.id, %format, error = %e, "Format conversion failed");
                ctx.note(&format!("Could not produce {format} output: {e}"))
                    .await;
            }
        }
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_filenames() {
        assert_eq!(output_filename(OutputFormat::Markdown), "output.md");
        assert_eq!(output_filename(OutputFormat::Html), "output.html");
        assert_eq!(output_filename(OutputFormat::Text), "output.txt");
    }
}
