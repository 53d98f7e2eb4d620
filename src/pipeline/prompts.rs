//! Prompt construction for each phase.

use crate::pipeline::types::{ResearchPlan, ResearchSummary};
use crate::research::SearchHit;
use crate::tasks::model::Task;

pub const PLANNING_SYSTEM: &str = "You are a research planner. Turn a task into a concrete plan.\n\n\
     Respond with ONLY a JSON object:\n\
     {\"objectives\": [...], \"research_questions\": [...], \"steps\": [...], \"output_structure\": [...], \"quality_criteria\": [...]}\n\n\
     Rules:\n\
     - Every field is a list of short strings\n\
     - 3 to 6 research questions, each answerable by a web search\n\
     - Output structure lists the section headings of the final document";

pub const QUERY_SYSTEM: &str = "You write web search queries. Respond with one query per line, \
     no numbering and no commentary. At most 8 queries.";

pub const SUMMARY_SYSTEM: &str = "You summarise web sources for a researcher. Keep facts, numbers \
     and names; drop navigation text and ads. Say which source each claim comes from.";

pub const SYNTHESIS_SYSTEM: &str = "You combine per-query research notes into one coherent \
     summary. Remove duplication, note disagreements between sources, keep it factual.";

pub const EXECUTION_SYSTEM: &str = "You are a careful writer. Produce the requested document in \
     Markdown, following the plan's output structure and grounding claims in the research.";

pub const CRITIQUE_SYSTEM: &str = "You are a strict reviewer. Assess the document against the plan's \
     objectives and quality criteria: coverage, accuracy, structure, clarity.\n\
     End with a verdict line. If the document needs rework, say \"needs revision\" and list the \
     issues; otherwise say it is acceptable.";

pub const REVISION_SYSTEM: &str = "You revise documents. Address every issue in the review while \
     keeping what already works. Respond with the full revised document in Markdown.";

/// Characters of each source kept in a summary prompt.
const SOURCE_PREVIEW_CHARS: usize = 2000;

pub fn planning_prompt(task: &Task) -> String {
    let mut prompt = format!("Task: {}\n", task.title);
    if !task.description.is_empty() {
        prompt.push_str(&format!("\nDescription:\n{}\n", task.description));
    }
    prompt.push_str(&format!("\nComplexity: {}\n", task.complexity));
    prompt
}

pub fn query_prompt(task: &Task, plan: &ResearchPlan) -> String {
    format!(
        "Task: {}\n\n{}\nWrite the search queries that would answer the research questions.",
        task.title,
        plan.to_markdown(&task.title)
    )
}

/// A fetched source: the search hit plus its page excerpt.
pub struct SourceText<'a> {
    pub hit: &'a SearchHit,
    pub text: &'a str,
}

pub fn summary_prompt(task: &Task, query: &str, sources: &[SourceText<'_>]) -> String {
    let mut prompt = format!("Task: {}\nQuery: {query}\n\nSources:\n", task.title);
    for (i, source) in sources.iter().enumerate() {
        let preview: String = source.text.chars().take(SOURCE_PREVIEW_CHARS).collect();
        prompt.push_str(&format!(
            "\n[{}] {} ({})\n{}\n",
            i + 1,
            source.hit.title,
            source.hit.url,
            preview
        ));
    }
    prompt.push_str("\nSummarise what these sources say about the query.");
    prompt
}

pub fn synthesis_prompt(task: &Task, plan: &ResearchPlan, research: &ResearchSummary) -> String {
    format!(
        "Task: {}\n\n{}\n## Notes per query\n\n{}\n\nSynthesise these notes into one summary.",
        task.title,
        plan.to_markdown(&task.title),
        research.joined_summaries()
    )
}

pub fn execution_prompt(task: &Task, plan: &ResearchPlan, research: &ResearchSummary) -> String {
    let mut prompt = format!("Task: {}\n", task.title);
    if !task.description.is_empty() {
        prompt.push_str(&format!("\nDescription:\n{}\n", task.description));
    }
    prompt.push_str(&format!("\n{}\n", plan.to_markdown(&task.title)));
    if research.synthesis.is_empty() {
        prompt.push_str("\nNo research findings are available; rely on general knowledge and say so.\n");
    } else {
        prompt.push_str(&format!("\n## Research\n\n{}\n", research.synthesis));
    }
    prompt.push_str("\nWrite the complete document now.");
    prompt
}

pub fn critique_prompt(task: &Task, plan: &ResearchPlan, artifact: &str) -> String {
    format!(
        "Task: {}\n\n{}\n## Document\n\n{artifact}\n\nReview the document.",
        task.title,
        plan.to_markdown(&task.title)
    )
}

pub fn revision_prompt(
    task: &Task,
    plan: &ResearchPlan,
    research: &ResearchSummary,
    artifact: &str,
    critique: &str,
) -> String {
    format!(
        "Task: {}\n\n{}\n## Research\n\n{}\n\n## Current document\n\n{artifact}\n\n## Review\n\n{critique}\n\nRevise the document.",
        task.title,
        plan.to_markdown(&task.title),
        research.synthesis
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planning_prompt_includes_description() {
        let task = Task::new("Solar power", "Costs in 2024").with_complexity(4);
        let prompt = planning_prompt(&task);
        assert!(prompt.contains("Task: Solar power"));
        assert!(prompt.contains("Costs in 2024"));
        assert!(prompt.contains("Complexity: 4"));
    }

    #[test]
    fn execution_prompt_flags_missing_research() {
        let task = Task::new("T", "");
        let prompt = execution_prompt(&task, &ResearchPlan::default(), &ResearchSummary::default());
        assert!(prompt.contains("No research findings"));
    }

    #[test]
    fn summary_prompt_numbers_sources() {
        let task = Task::new("T", "");
        let hit = SearchHit {
            title: "Doc".into(),
            url: "https://d.example".into(),
            snippet: String::new(),
        };
        let sources = [SourceText {
            hit: &hit,
            text: "body",
        }];
        let prompt = summary_prompt(&task, "q", &sources);
        assert!(prompt.contains("[1] Doc (https://d.example)\nbody"));
    }

    #[test]
    fn system_prompts_are_distinct() {
        let all = [
            PLANNING_SYSTEM,
            QUERY_SYSTEM,
            SUMMARY_SYSTEM,
            SYNTHESIS_SYSTEM,
            EXECUTION_SYSTEM,
            CRITIQUE_SYSTEM,
            REVISION_SYSTEM,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
