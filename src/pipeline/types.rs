//! Shared types for the phase pipeline.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::research::SearchHit;

// ── Plan ────────────────────────────────────────────────────────────

/// Structured plan produced by the planning phase.
///
/// When the model does not answer with parseable JSON the lists stay empty
/// and `raw` carries the plan text as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchPlan {
    #[serde(default)]
    pub objectives: Vec<String>,
    #[serde(default)]
    pub research_questions: Vec<String>,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub output_structure: Vec<String>,
    #[serde(default)]
    pub quality_criteria: Vec<String>,
    #[serde(skip)]
    pub raw: String,
}

impl ResearchPlan {
    /// Parse model output into a plan, falling back to free text.
    pub fn parse(raw: &str) -> Self {
        let json = extract_json_object(raw);
        match serde_json::from_str::<ResearchPlan>(&json) {
            Ok(mut plan) if !plan.is_unstructured() => {
                plan.raw = raw.trim().to_string();
                plan
            }
            _ => Self {
                raw: raw.trim().to_string(),
                ..Self::default()
            },
        }
    }

    /// True when no section was recovered from the model output.
    pub fn is_unstructured(&self) -> bool {
        self.objectives.is_empty()
            && self.research_questions.is_empty()
            && self.steps.is_empty()
            && self.output_structure.is_empty()
            && self.quality_criteria.is_empty()
    }

    /// Render as markdown for the artifact and for later prompts.
    pub fn to_markdown(&self, title: &str) -> String {
        if self.is_unstructured() {
            return format!("# Plan: {title}\n\n{}\n", self.raw);
        }

        let mut out = format!("# Plan: {title}\n");
        for (heading, items) in [
            ("Objectives", &self.objectives),
            ("Research questions", &self.research_questions),
            ("Steps", &self.steps),
            ("Output structure", &self.output_structure),
            ("Quality criteria", &self.quality_criteria),
        ] {
            if items.is_empty() {
                continue;
            }
            out.push_str(&format!("\n## {heading}\n\n"));
            for item in items {
                out.push_str(&format!("- {item}\n"));
            }
        }
        out
    }
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
pub fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

// ── Research ────────────────────────────────────────────────────────

/// What a successful query produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryFindings {
    pub sources: Vec<SearchHit>,
    pub summary: String,
}

/// Why a query contributed nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryFailure {
    SearchFailed(String),
    NoResults,
    SummaryUnavailable,
}

impl fmt::Display for QueryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SearchFailed(reason) => write!(f, "search failed: {reason}"),
            Self::NoResults => write!(f, "no results"),
            Self::SummaryUnavailable => write!(f, "summary unavailable"),
        }
    }
}

/// Outcome of one search query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOutcome {
    pub query: String,
    pub result: Result<QueryFindings, QueryFailure>,
}

/// Everything the research phase gathered.
#[derive(Debug, Clone, Default)]
pub struct ResearchSummary {
    pub outcomes: Vec<QueryOutcome>,
    /// Cross-query synthesis; empty when every query failed.
    pub synthesis: String,
}

impl ResearchSummary {
    pub fn succeeded(&self) -> impl Iterator<Item = (&str, &QueryFindings)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok().map(|f| (o.query.as_str(), f)))
    }

    pub fn succeeded_count(&self) -> usize {
        self.succeeded().count()
    }

    /// Per-query summaries joined, for when synthesis is unavailable.
    pub fn joined_summaries(&self) -> String {
        self.succeeded()
            .map(|(query, findings)| format!("### {query}\n\n{}", findings.summary))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn to_markdown(&self, title: &str) -> String {
        let mut out = format!("# Research: {title}\n\n## Summary\n\n");
        if self.synthesis.is_empty() {
            out.push_str("_No research findings were available._\n");
        } else {
            out.push_str(&self.synthesis);
            out.push('\n');
        }

        out.push_str("\n## Queries\n");
        for outcome in &self.outcomes {
            out.push_str(&format!("\n### {}\n\n", outcome.query));
            match &outcome.result {
                Ok(findings) => {
                    out.push_str(&findings.summary);
                    out.push_str("\n\nSources:\n");
                    for source in &findings.sources {
                        out.push_str(&format!("- [{}]({})\n", source.title, source.url));
                    }
                }
                Err(failure) => out.push_str(&format!("_Skipped: {failure}._\n")),
            }
        }
        out
    }
}

// ── Execution / review ──────────────────────────────────────────────

/// The primary artifact and where it was written.
#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    pub content: String,
    pub path: PathBuf,
    pub secondary: Vec<PathBuf>,
}

/// What the review phase decided.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReviewOutcome {
    /// Empty when the critique call failed.
    pub critique: String,
    pub revised: bool,
    pub final_critique: Option<String>,
}

/// Summary of a finished pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub task_id: Uuid,
    pub output_path: PathBuf,
    pub secondary_paths: Vec<PathBuf>,
    pub queries_total: usize,
    pub queries_succeeded: usize,
    pub revised: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_parses_json_in_code_fence() {
        let raw = "Here you go:\n```json\n{\"objectives\": [\"Explain X\"], \"steps\": [\"Read\", \"Write\"]}\n```";
        let plan = ResearchPlan::parse(raw);
        assert_eq!(plan.objectives, vec!["Explain X"]);
        assert_eq!(plan.steps.len(), 2);
        assert!(plan.research_questions.is_empty());
        assert!(!plan.is_unstructured());
    }

    #[test]
    fn plan_falls_back_to_raw_text() {
        let plan = ResearchPlan::parse("1. Look into it\n2. Write it up");
        assert!(plan.is_unstructured());
        let md = plan.to_markdown("Topic");
        assert!(md.starts_with("# Plan: Topic"));
        assert!(md.contains("Write it up"));
    }

    #[test]
    fn plan_markdown_lists_sections() {
        let plan = ResearchPlan {
            objectives: vec!["A".into()],
            quality_criteria: vec!["Accurate".into()],
            ..Default::default()
        };
        let md = plan.to_markdown("T");
        assert!(md.contains("## Objectives\n\n- A"));
        assert!(md.contains("## Quality criteria"));
        assert!(!md.contains("## Steps"));
    }

    #[test]
    fn research_summary_counts_and_joins() {
        let summary = ResearchSummary {
            outcomes: vec![
                QueryOutcome {
                    query: "q1".into(),
                    result: Ok(QueryFindings {
                        sources: vec![],
                        summary: "one".into(),
                    }),
                },
                QueryOutcome {
                    query: "q2".into(),
                    result: Err(QueryFailure::NoResults),
                },
            ],
            synthesis: String::new(),
        };
        assert_eq!(summary.succeeded_count(), 1);
        assert_eq!(summary.joined_summaries(), "### q1\n\none");
        let md = summary.to_markdown("T");
        assert!(md.contains("_Skipped: no results._"));
        assert!(md.contains("No research findings"));
    }
}
