//! Research phase (`build`).
//!
//! Each query's outcome is kept as a `Result`; a failed search or summary
//! only drops that query. When every query fails the pipeline continues
//! with an empty synthesis.

use std::collections::HashSet;
use std::sync::LazyLock;

use futures::future::join_all;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::pipeline::PhaseContext;
use crate::pipeline::prompts::{self, SourceText};
use crate::pipeline::types::{
    QueryFailure, QueryFindings, QueryOutcome, ResearchPlan, ResearchSummary,
};
use crate::research::html::excerpt;
use crate::tasks::model::TaskStatus;
use crate::workspace::artifacts;

/// Progress at the start and end of the query loop.
const QUERIES_START: u8 = 10;
const QUERIES_SPAN: usize = 70;

/// Queries longer than this are prose, not queries.
const MAX_QUERY_CHARS: usize = 200;

static LIST_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[-*•]+|\d+[.)]|\(\d+\))\s*").unwrap());

/// Extract search queries from model output.
///
/// Accepts a JSON array of strings or one query per line (bullets and
/// numbering are stripped). Duplicates are dropped, the list is capped at
/// `max`, and `fallback` is used when nothing parses.
pub fn parse_search_queries(raw: &str, fallback: &str, max: usize) -> Vec<String> {
    let candidates: Vec<String> = match serde_json::from_str::<Vec<String>>(raw.trim()) {
        Ok(list) => list,
        Err(_) => raw
            .lines()
            .map(|line| LIST_MARKER.replace(line, "").into_owned())
            .collect(),
    };

    let mut seen = HashSet::new();
    let mut queries: Vec<String> = candidates
        .into_iter()
        .map(|q| q.trim().trim_matches('"').trim().to_string())
        .filter(|q| !q.is_empty() && !q.ends_with(':') && q.chars().count() <= MAX_QUERY_CHARS)
        .filter(|q| seen.insert(q.to_lowercase()))
        .take(max)
        .collect();

    if queries.is_empty() && !fallback.trim().is_empty() {
        queries.push(fallback.trim().to_string());
    }
    queries
}

pub async fn run(
    ctx: &PhaseContext<'_>,
    plan: &ResearchPlan,
) -> Result<ResearchSummary, PipelineError> {
    ctx.progress(TaskStatus::Build, 0, "Research started").await?;

    let raw = ctx
        .generate(
            prompts::QUERY_SYSTEM,
            prompts::query_prompt(ctx.task, plan),
            ctx.config().summary_tokens,
        )
        .await;
    let queries = parse_search_queries(&raw, &ctx.task.title, ctx.config().max_queries);
    ctx.progress(
        TaskStatus::Build,
        QUERIES_START,
        &format!("Running {} search queries", queries.len()),
    )
    .await?;

    let total = queries.len();
    let mut summary = ResearchSummary::default();
    for (i, query) in queries.into_iter().enumerate() {
        let outcome = research_query(ctx, &query).await;
        let status = match &outcome {
            Ok(_) => "done".to_string(),
            Err(failure) => {
                warn!(task_id = %ctx.task.id, query = %query, %failure, "Research query degraded");
                failure.to_string()
            }
        };
        let pct = QUERIES_START as usize + QUERIES_SPAN * (i + 1) / total.max(1);
        ctx.progress(
            TaskStatus::Build,
            u8::try_from(pct).unwrap_or(80),
            &format!("Query {}/{total} ({status}): {query}", i + 1),
        )
        .await?;
        summary.outcomes.push(QueryOutcome {
            query,
            result: outcome,
        });
    }

    if summary.succeeded_count() == 0 {
        ctx.note("All research queries failed; continuing without research findings")
            .await;
    } else {
        let synthesis = ctx
            .generate(
                prompts::SYNTHESIS_SYSTEM,
                prompts::synthesis_prompt(ctx.task, plan, &summary),
                ctx.config().summary_tokens,
            )
            .await;
        summary.synthesis = if synthesis.trim().is_empty() {
            ctx.note("Research synthesis unavailable; using per-query summaries")
                .await;
            summary.joined_summaries()
        } else {
            synthesis
        };
    }
    ctx.progress(TaskStatus::Build, 90, "Research synthesized").await?;

    ctx.save(artifacts::RESEARCH, &summary.to_markdown(&ctx.task.title))
        .await?;
    ctx.progress(
        TaskStatus::Build,
        100,
        &format!(
            "Research complete: {}/{} queries produced findings",
            summary.succeeded_count(),
            total
        ),
    )
    .await?;
    Ok(summary)
}

/// Search, fetch pages concurrently, summarise.
async fn research_query(
    ctx: &PhaseContext<'_>,
    query: &str,
) -> Result<QueryFindings, QueryFailure> {
    let research = &ctx.deps.research;
    let hits = research
        .search(query, ctx.config().results_per_query)
        .await
        .map_err(|e| QueryFailure::SearchFailed(e.to_string()))?;
    if hits.is_empty() {
        return Err(QueryFailure::NoResults);
    }

    let pages = join_all(hits.iter().map(|hit| research.fetch_page(&hit.url))).await;
    let texts: Vec<String> = hits
        .iter()
        .zip(pages)
        .map(|(hit, page)| match page {
            Ok(text) if !text.trim().is_empty() => excerpt(&text, ctx.config().excerpt_chars),
            Ok(_) => hit.snippet.clone(),
            Err(e) => {
                debug!(url = %hit.url, error = %e, "Page fetch failed; using snippet");
                hit.snippet.clone()
            }
        })
        .collect();

    let sources: Vec<SourceText<'_>> = hits
        .iter()
        .zip(&texts)
        .map(|(hit, text)| SourceText { hit, text })
        .collect();
    let summary = ctx
        .generate(
            prompts::SUMMARY_SYSTEM,
            prompts::summary_prompt(ctx.task, query, &sources),
            ctx.config().summary_tokens,
        )
        .await;
    if summary.trim().is_empty() {
        return Err(QueryFailure::SummaryUnavailable);
    }

    Ok(QueryFindings {
        sources: hits,
        summary,
    })
}
