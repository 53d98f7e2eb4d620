//! Integration tests for the dispatch loop.
//!
//! Each test wires a real `Scheduler` to an in-memory libSQL store, a
//! temporary artifact directory, a stub inference transport that answers
//! by phase (keyed on the system prompt) and a stub research client.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;
use uuid::Uuid;

use agent_dispatch::config::{PipelineConfig, SchedulerConfig};
use agent_dispatch::error::{DatabaseError, LlmError, ResearchError};
use agent_dispatch::llm::{
    FallbackTable, GenerateRequest, InferenceTransport, LlmGateway, RetryPolicy,
};
use agent_dispatch::pipeline::prompts;
use agent_dispatch::pipeline::{BasicRenderer, PhasePipeline, PipelineDeps};
use agent_dispatch::research::{ResearchClient, SearchHit};
use agent_dispatch::store::{Database, LibSqlBackend, ReclaimedAgent};
use agent_dispatch::tasks::{
    Agent, AgentStatus, OutputFormat, Task, TaskStatus, TaskUpdate, UpdateType,
};
use agent_dispatch::worker::{IterationOutcome, Scheduler};
use agent_dispatch::workspace::Workspace;

const UNKNOWN_ROUTE: &str = "unknown";

const PLAN_JSON: &str = r#"{"objectives": ["Explain the topic"], "research_questions": ["What is it?"], "steps": ["Research", "Write"], "output_structure": ["Introduction", "Findings"], "quality_criteria": ["Accurate", "Cited"]}"#;

// ── Stub transport ──────────────────────────────────────────────────

/// Answers generation requests per phase.
///
/// Queued responses are consumed first, then the route's default. A route
/// with neither fails with HTTP 503.
struct RoutedTransport {
    queued: Mutex<HashMap<&'static str, VecDeque<String>>>,
    defaults: HashMap<&'static str, String>,
    hang_on: Option<&'static str>,
    panic_on: Option<&'static str>,
    calls: Mutex<Vec<(&'static str, String)>>,
}

fn route_of(system: Option<&str>) -> &'static str {
    [
        prompts::PLANNING_SYSTEM,
        prompts::QUERY_SYSTEM,
        prompts::SUMMARY_SYSTEM,
        prompts::SYNTHESIS_SYSTEM,
        prompts::EXECUTION_SYSTEM,
        prompts::CRITIQUE_SYSTEM,
        prompts::REVISION_SYSTEM,
    ]
    .into_iter()
    .find(|route| Some(*route) == system)
    .unwrap_or(UNKNOWN_ROUTE)
}

impl RoutedTransport {
    /// Every phase succeeds and the review accepts the first draft.
    fn happy() -> Self {
        let defaults = HashMap::from([
            (prompts::PLANNING_SYSTEM, PLAN_JSON.to_string()),
            (prompts::QUERY_SYSTEM, "1. first query\n2. second query".to_string()),
            (prompts::SUMMARY_SYSTEM, "Sources agree on the basics.".to_string()),
            (prompts::SYNTHESIS_SYSTEM, "Overall synthesis.".to_string()),
            (prompts::EXECUTION_SYSTEM, "# Report\n\nFirst draft.".to_string()),
            (prompts::CRITIQUE_SYSTEM, "Acceptable. Minor typos only.".to_string()),
            (prompts::REVISION_SYSTEM, "# Report\n\nRevised draft.".to_string()),
        ]);
        Self {
            queued: Mutex::new(HashMap::new()),
            defaults,
            hang_on: None,
            panic_on: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn with_default(mut self, route: &'static str, text: &str) -> Self {
        self.defaults.insert(route, text.to_string());
        self
    }

    fn without_default(mut self, route: &'static str) -> Self {
        self.defaults.remove(route);
        self
    }

    fn with_queued(self, route: &'static str, responses: &[&str]) -> Self {
        self.queued
            .lock()
            .unwrap()
            .entry(route)
            .or_default()
            .extend(responses.iter().map(|r| r.to_string()));
        self
    }

    fn hanging_on(mut self, route: &'static str) -> Self {
        self.hang_on = Some(route);
        self
    }

    fn panicking_on(mut self, route: &'static str) -> Self {
        self.panic_on = Some(route);
        self
    }

    fn count(&self, route: &'static str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| *r == route)
            .count()
    }

    fn models(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, model)| model.clone())
            .collect()
    }
}

#[async_trait]
impl InferenceTransport for RoutedTransport {
    fn name(&self) -> &str {
        "routed-stub"
    }

    async fn send(&self, request: &GenerateRequest, _timeout: Duration) -> Result<String, LlmError> {
        let route = route_of(request.system.as_deref());
        self.calls
            .lock()
            .unwrap()
            .push((route, request.model.clone()));

        if self.panic_on == Some(route) {
            panic!("stub transport exploded");
        }
        if self.hang_on == Some(route) {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }

        let queued = self
            .queued
            .lock()
            .unwrap()
            .get_mut(route)
            .and_then(|q| q.pop_front());
        match queued.or_else(|| self.defaults.get(route).cloned()) {
            Some(text) => Ok(text),
            None => Err(LlmError::HttpStatus {
                model: request.model.clone(),
                status: 503,
                body: "unavailable".into(),
            }),
        }
    }
}

// ── Stub research ───────────────────────────────────────────────────

#[derive(Default)]
struct StubResearch {
    fail_all_searches: bool,
    fail_query: Option<&'static str>,
    searches: AtomicUsize,
}

#[async_trait]
impl ResearchClient for StubResearch {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, ResearchError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        if self.fail_all_searches || self.fail_query == Some(query) {
            return Err(ResearchError::SearchFailed {
                query: query.to_string(),
                reason: "connection refused".into(),
            });
        }
        Ok((1..=limit.min(2))
            .map(|n| SearchHit {
                title: format!("Result {n}"),
                url: format!("https://example.com/{n}"),
                snippet: format!("Snippet {n}"),
            })
            .collect())
    }

    async fn fetch_page(&self, url: &str) -> Result<String, ResearchError> {
        if url.ends_with("/2") {
            return Err(ResearchError::FetchFailed {
                url: url.to_string(),
                reason: "timeout".into(),
            });
        }
        Ok("Page text about the topic.".to_string())
    }
}

// ── Fault-injecting store ───────────────────────────────────────────

/// Delegates to an in-memory store, failing selected calls a set number
/// of times first.
struct FaultyStore {
    inner: LibSqlBackend,
    failing_selects: AtomicUsize,
    failing_resets: AtomicUsize,
    reconnects: AtomicUsize,
    selects_at: Mutex<Vec<tokio::time::Instant>>,
}

impl FaultyStore {
    async fn new() -> Self {
        Self {
            inner: LibSqlBackend::new_memory().await.unwrap(),
            failing_selects: AtomicUsize::new(0),
            failing_resets: AtomicUsize::new(0),
            reconnects: AtomicUsize::new(0),
            selects_at: Mutex::new(Vec::new()),
        }
    }

    fn fail_selects(self, times: usize) -> Self {
        self.failing_selects.store(times, Ordering::SeqCst);
        self
    }

    fn fail_resets(self, times: usize) -> Self {
        self.failing_resets.store(times, Ordering::SeqCst);
        self
    }

    fn select_gaps(&self) -> Vec<Duration> {
        self.selects_at
            .lock()
            .unwrap()
            .windows(2)
            .map(|pair| pair[1].duration_since(pair[0]))
            .collect()
    }
}

/// Consume one injected fault, if any remain.
fn take_fault(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn locked(op: &str) -> DatabaseError {
    DatabaseError::Query(format!("{op}: database is locked"))
}

#[async_trait]
impl Database for FaultyStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        self.inner.run_migrations().await
    }

    async fn reconnect(&self) -> Result<(), DatabaseError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        self.inner.reconnect().await
    }

    async fn create_task(&self, task: &Task) -> Result<(), DatabaseError> {
        self.inner.create_task(task).await
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        self.inner.get_task(id).await
    }

    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DatabaseError> {
        self.inner.list_tasks_by_status(status).await
    }

    async fn next_eligible_task(&self) -> Result<Option<Task>, DatabaseError> {
        self.selects_at
            .lock()
            .unwrap()
            .push(tokio::time::Instant::now());
        if take_fault(&self.failing_selects) {
            return Err(locked("next_eligible_task"));
        }
        self.inner.next_eligible_task().await
    }

    async fn set_result_path(&self, task_id: Uuid, path: &str) -> Result<(), DatabaseError> {
        self.inner.set_result_path(task_id, path).await
    }

    async fn register_agent(&self, agent: &Agent) -> Result<(), DatabaseError> {
        self.inner.register_agent(agent).await
    }

    async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>, DatabaseError> {
        self.inner.get_agent(id).await
    }

    async fn find_agent_by_name(&self, name: &str) -> Result<Option<Agent>, DatabaseError> {
        self.inner.find_agent_by_name(name).await
    }

    async fn list_agents_by_status(
        &self,
        status: AgentStatus,
    ) -> Result<Vec<Agent>, DatabaseError> {
        self.inner.list_agents_by_status(status).await
    }

    async fn available_agent_for(&self, complexity: i32) -> Result<Option<Agent>, DatabaseError> {
        self.inner.available_agent_for(complexity).await
    }

    async fn assign_task(&self, task_id: Uuid, agent_id: Uuid) -> Result<bool, DatabaseError> {
        self.inner.assign_task(task_id, agent_id).await
    }

    async fn update_task_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        progress: u8,
        message: &str,
        agent_id: Option<Uuid>,
    ) -> Result<bool, DatabaseError> {
        self.inner
            .update_task_status(task_id, status, progress, message, agent_id)
            .await
    }

    async fn reset_task(&self, task_id: Uuid, reason: &str) -> Result<bool, DatabaseError> {
        if take_fault(&self.failing_resets) {
            return Err(locked("reset_task"));
        }
        self.inner.reset_task(task_id, reason).await
    }

    async fn reclaim_agent(
        &self,
        agent_id: Uuid,
        stale_before: DateTime<Utc>,
        reason: &str,
    ) -> Result<Option<ReclaimedAgent>, DatabaseError> {
        self.inner
            .reclaim_agent(agent_id, stale_before, reason)
            .await
    }

    async fn append_update(
        &self,
        task_id: Uuid,
        agent_id: Option<Uuid>,
        update_type: UpdateType,
        content: &str,
    ) -> Result<TaskUpdate, DatabaseError> {
        self.inner
            .append_update(task_id, agent_id, update_type, content)
            .await
    }

    async fn list_updates(&self, task_id: Uuid) -> Result<Vec<TaskUpdate>, DatabaseError> {
        self.inner.list_updates(task_id).await
    }
}

// ── Harness ─────────────────────────────────────────────────────────

struct Harness {
    db: Arc<dyn Database>,
    scheduler: Scheduler,
    transport: Arc<RoutedTransport>,
    research: Arc<StubResearch>,
    workspace: Workspace,
    _tmp: TempDir,
}

fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        poll_interval: Duration::from_millis(10),
        stale_threshold: Duration::from_secs(1800),
        pipeline_deadline: Duration::from_secs(30),
        recover_on_startup: false,
    }
}

/// One attempt, no backoff, no fallback.
fn fast_policy() -> RetryPolicy {
    RetryPolicy::new(1, 0.0, Duration::from_secs(30)).with_fallbacks(FallbackTable::empty())
}

async fn harness_with(
    transport: RoutedTransport,
    research: StubResearch,
    config: SchedulerConfig,
) -> Harness {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    harness_on(db, transport, research, config)
}

fn harness_on(
    db: Arc<dyn Database>,
    transport: RoutedTransport,
    research: StubResearch,
    config: SchedulerConfig,
) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let workspace = Workspace::new(tmp.path());
    let transport = Arc::new(transport);
    let research = Arc::new(research);

    let pipeline = PhasePipeline::new(PipelineDeps {
        store: db.clone(),
        gateway: LlmGateway::new(transport.clone(), fast_policy()),
        research: research.clone(),
        workspace: workspace.clone(),
        renderer: Arc::new(BasicRenderer),
        config: PipelineConfig::default(),
    });
    let scheduler = Scheduler::new(db.clone(), pipeline, config);

    Harness {
        db,
        scheduler,
        transport,
        research,
        workspace,
        _tmp: tmp,
    }
}

async fn harness(transport: RoutedTransport) -> Harness {
    harness_with(transport, StubResearch::default(), scheduler_config()).await
}

impl Harness {
    async fn add_task(&self, priority: i32, complexity: i32) -> Task {
        let task = Task::new(format!("Task p{priority}"), "Write a short report")
            .with_priority(priority)
            .with_complexity(complexity);
        self.db.create_task(&task).await.unwrap();
        task
    }

    async fn add_agent(&self, name: &str, min: i32, max: i32) -> Agent {
        let agent = Agent::new(name, "test-model", min, max);
        self.db.register_agent(&agent).await.unwrap();
        agent
    }

    async fn task(&self, id: uuid::Uuid) -> Task {
        self.db.get_task(id).await.unwrap().unwrap()
    }

    async fn agent(&self, id: uuid::Uuid) -> Agent {
        self.db.get_agent(id).await.unwrap().unwrap()
    }
}

// ── Scheduling ──────────────────────────────────────────────────────

#[tokio::test]
async fn higher_priority_task_is_dispatched_first() {
    let h = harness(RoutedTransport::happy()).await;
    let low = h.add_task(5, 3).await;
    let high = h.add_task(9, 3).await;
    let agent = h.add_agent("worker", 1, 5).await;

    let outcome = h.scheduler.run_iteration().await;
    assert_eq!(
        outcome,
        IterationOutcome::Completed {
            task_id: high.id,
            agent_id: agent.id
        }
    );

    let high = h.task(high.id).await;
    assert_eq!(high.status, TaskStatus::Complete);
    assert_eq!(high.stage_progress, 100);
    assert!(high.completed_at.is_some());
    assert!(high.assigned_agent_id.is_none());
    assert_eq!(h.task(low.id).await.status, TaskStatus::NotStarted);
    assert_eq!(h.agent(agent.id).await.status, AgentStatus::Available);

    // The lower-priority task goes next
    let outcome = h.scheduler.run_iteration().await;
    assert!(matches!(outcome, IterationOutcome::Completed { task_id, .. } if task_id == low.id));
}

#[tokio::test]
async fn completed_task_walks_every_stage_in_order() {
    let h = harness(RoutedTransport::happy()).await;
    let task = h.add_task(1, 2).await;
    h.add_agent("worker", 1, 5).await;

    h.scheduler.run_iteration().await;

    let stages: Vec<TaskStatus> = h
        .db
        .list_updates(task.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|u| u.update_type == UpdateType::StatusChange)
        .map(|u| u.stage)
        .collect();
    assert_eq!(
        stages,
        vec![
            TaskStatus::Design,
            TaskStatus::Build,
            TaskStatus::Test,
            TaskStatus::Review,
            TaskStatus::Complete
        ]
    );

    for name in ["plan.md", "research.md", "output.md", "review.md"] {
        assert!(
            h.workspace.read_artifact(task.id, name).await.is_ok(),
            "missing {name}"
        );
    }
    let task = h.task(task.id).await;
    let result_path = task.result_path.expect("result path set");
    assert!(result_path.ends_with("output.md"));

    let plan = h.workspace.read_artifact(task.id, "plan.md").await.unwrap();
    assert!(plan.contains("## Quality criteria"));
}

#[tokio::test]
async fn no_agent_in_band_leaves_task_queued() {
    let h = harness(RoutedTransport::happy()).await;
    let task = h.add_task(5, 9).await;
    h.add_agent("small", 1, 5).await;

    let outcome = h.scheduler.run_iteration().await;
    assert_eq!(
        outcome,
        IterationOutcome::NoAgent {
            task_id: task.id,
            reclaimed: 0
        }
    );
    let task = h.task(task.id).await;
    assert_eq!(task.status, TaskStatus::NotStarted);
    assert!(h.db.list_updates(task.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn empty_queue_is_idle() {
    let h = harness(RoutedTransport::happy()).await;
    h.add_agent("worker", 1, 5).await;
    assert_eq!(
        h.scheduler.run_iteration().await,
        IterationOutcome::Idle { reclaimed: 0 }
    );
}

// ── Failures ────────────────────────────────────────────────────────

#[tokio::test]
async fn empty_plan_resets_task_without_later_phases() {
    let h = harness(RoutedTransport::happy().with_default(prompts::PLANNING_SYSTEM, "")).await;
    let task = h.add_task(5, 3).await;
    let agent = h.add_agent("worker", 1, 5).await;

    let outcome = h.scheduler.run_iteration().await;
    assert!(matches!(outcome, IterationOutcome::Failed { task_id, .. } if task_id == task.id));

    let task_row = h.task(task.id).await;
    assert_eq!(task_row.status, TaskStatus::NotStarted);
    assert_eq!(task_row.stage_progress, 0);
    assert!(task_row.assigned_agent_id.is_none());
    assert_eq!(h.agent(agent.id).await.status, AgentStatus::Available);

    let updates = h.db.list_updates(task.id).await.unwrap();
    assert!(
        updates
            .iter()
            .all(|u| !matches!(u.stage, TaskStatus::Build | TaskStatus::Test | TaskStatus::Review))
    );
    assert!(
        updates
            .iter()
            .any(|u| u.update_type == UpdateType::Note && u.content.contains("Planning failed"))
    );
    assert_eq!(h.transport.count(prompts::QUERY_SYSTEM), 0);
    assert_eq!(h.research.searches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_artifact_keeps_plan_and_research() {
    let h = harness(RoutedTransport::happy().without_default(prompts::EXECUTION_SYSTEM)).await;
    let task = h.add_task(5, 3).await;
    h.add_agent("worker", 1, 5).await;

    let outcome = h.scheduler.run_iteration().await;
    assert!(matches!(outcome, IterationOutcome::Failed { .. }));
    assert_eq!(h.task(task.id).await.status, TaskStatus::NotStarted);
    assert!(h.workspace.read_artifact(task.id, "plan.md").await.is_ok());
    assert!(h.workspace.read_artifact(task.id, "research.md").await.is_ok());
    assert!(h.workspace.read_artifact(task.id, "output.md").await.is_err());
}

#[tokio::test]
async fn pipeline_past_deadline_is_reset() {
    let config = SchedulerConfig {
        pipeline_deadline: Duration::from_millis(200),
        ..scheduler_config()
    };
    let h = harness_with(
        RoutedTransport::happy().hanging_on(prompts::PLANNING_SYSTEM),
        StubResearch::default(),
        config,
    )
    .await;
    let task = h.add_task(5, 3).await;
    let agent = h.add_agent("worker", 1, 5).await;

    let outcome = h.scheduler.run_iteration().await;
    match outcome {
        IterationOutcome::Failed { reason, .. } => assert!(reason.contains("deadline")),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(h.task(task.id).await.status, TaskStatus::NotStarted);
    assert_eq!(h.agent(agent.id).await.status, AgentStatus::Available);
}

#[tokio::test]
async fn pipeline_panic_is_isolated() {
    let h = harness(RoutedTransport::happy().panicking_on(prompts::EXECUTION_SYSTEM)).await;
    let task = h.add_task(5, 3).await;
    h.add_agent("worker", 1, 5).await;

    let outcome = h.scheduler.run_iteration().await;
    match outcome {
        IterationOutcome::Failed { reason, .. } => assert!(reason.contains("panicked")),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(h.task(task.id).await.status, TaskStatus::NotStarted);

    // The scheduler keeps working afterwards
    assert_eq!(
        h.scheduler.run_iteration().await,
        IterationOutcome::Failed {
            task_id: task.id,
            agent_id: h.db.find_agent_by_name("worker").await.unwrap().unwrap().id,
            reason: "Pipeline panicked".into(),
        }
    );
}

// ── Research degradation ────────────────────────────────────────────

#[tokio::test]
async fn all_searches_failing_still_completes() {
    let research = StubResearch {
        fail_all_searches: true,
        ..Default::default()
    };
    let h = harness_with(RoutedTransport::happy(), research, scheduler_config()).await;
    let task = h.add_task(5, 3).await;
    h.add_agent("worker", 1, 5).await;

    let outcome = h.scheduler.run_iteration().await;
    assert!(matches!(outcome, IterationOutcome::Completed { .. }));
    assert_eq!(h.transport.count(prompts::SYNTHESIS_SYSTEM), 0);

    let notes: Vec<String> = h
        .db
        .list_updates(task.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|u| u.update_type == UpdateType::Note)
        .map(|u| u.content)
        .collect();
    assert!(notes.iter().any(|n| n.contains("All research queries failed")));
}

#[tokio::test]
async fn one_failing_query_is_skipped() {
    let research = StubResearch {
        fail_query: Some("second query"),
        ..Default::default()
    };
    let h = harness_with(RoutedTransport::happy(), research, scheduler_config()).await;
    let task = h.add_task(5, 3).await;
    h.add_agent("worker", 1, 5).await;

    let outcome = h.scheduler.run_iteration().await;
    assert!(matches!(outcome, IterationOutcome::Completed { .. }));
    assert_eq!(h.transport.count(prompts::SUMMARY_SYSTEM), 1);
    assert_eq!(h.transport.count(prompts::SYNTHESIS_SYSTEM), 1);

    let research_md = h.workspace.read_artifact(task.id, "research.md").await.unwrap();
    assert!(research_md.contains("_Skipped: search failed"));
    assert!(research_md.contains("Overall synthesis."));
}

// ── Review ──────────────────────────────────────────────────────────

#[tokio::test]
async fn review_revises_exactly_once() {
    let transport = RoutedTransport::happy().with_queued(
        prompts::CRITIQUE_SYSTEM,
        &[
            "The report needs major revisions: no sources are cited.",
            "Better, but still needs major revisions.",
        ],
    );
    let h = harness(transport).await;
    let task = h.add_task(5, 3).await;
    h.add_agent("worker", 1, 5).await;

    let outcome = h.scheduler.run_iteration().await;
    assert!(matches!(outcome, IterationOutcome::Completed { .. }));

    assert_eq!(h.transport.count(prompts::REVISION_SYSTEM), 1);
    assert_eq!(h.transport.count(prompts::CRITIQUE_SYSTEM), 2);

    let output = h.workspace.read_artifact(task.id, "output.md").await.unwrap();
    assert!(output.contains("Revised draft."));
    let final_review = h
        .workspace
        .read_artifact(task.id, "review_final.md")
        .await
        .unwrap();
    assert!(final_review.contains("still needs major revisions"));

    let updates = h.db.list_updates(task.id).await.unwrap();
    let final_updates = updates
        .iter()
        .filter(|u| u.content.starts_with("Final review:"))
        .count();
    assert_eq!(final_updates, 1);
    assert_eq!(h.task(task.id).await.status, TaskStatus::Complete);
}

#[tokio::test]
async fn empty_critique_accepts_output() {
    let h = harness(RoutedTransport::happy().without_default(prompts::CRITIQUE_SYSTEM)).await;
    let task = h.add_task(5, 3).await;
    h.add_agent("worker", 1, 5).await;

    let outcome = h.scheduler.run_iteration().await;
    assert!(matches!(outcome, IterationOutcome::Completed { .. }));
    assert_eq!(h.transport.count(prompts::REVISION_SYSTEM), 0);
    assert!(h.workspace.read_artifact(task.id, "review.md").await.is_err());
}

#[tokio::test]
async fn secondary_formats_are_rendered() {
    let h = harness(RoutedTransport::happy()).await;
    let task = Task::new("Formatted", "")
        .with_complexity(2)
        .with_output_format(OutputFormat::Html)
        .with_output_format(OutputFormat::Text);
    h.db.create_task(&task).await.unwrap();
    h.add_agent("worker", 1, 5).await;

    h.scheduler.run_iteration().await;

    let html = h.workspace.read_artifact(task.id, "output.html").await.unwrap();
    assert!(html.contains("<h1>Report</h1>"));
    let text = h.workspace.read_artifact(task.id, "output.txt").await.unwrap();
    assert!(text.starts_with("Report"));
}

#[tokio::test]
async fn failed_conversion_is_noted_and_skipped() {
    let transport = RoutedTransport::happy().with_default(prompts::EXECUTION_SYSTEM, "**`*`**");
    let h = harness(transport).await;
    let task = Task::new("Markup only", "")
        .with_complexity(2)
        .with_output_format(OutputFormat::Text);
    h.db.create_task(&task).await.unwrap();
    h.add_agent("worker", 1, 5).await;

    let outcome = h.scheduler.run_iteration().await;
    assert!(matches!(outcome, IterationOutcome::Completed { .. }));
    assert!(h.workspace.read_artifact(task.id, "output.md").await.is_ok());
    assert!(h.workspace.read_artifact(task.id, "output.txt").await.is_err());

    let updates = h.db.list_updates(task.id).await.unwrap();
    assert!(updates.iter().any(|u| {
        u.update_type == UpdateType::Note && u.content.starts_with("Could not produce text output")
    }));
}

// ── Reclaim and recovery ────────────────────────────────────────────

#[tokio::test]
async fn stale_agent_is_reclaimed_when_idle() {
    let config = SchedulerConfig {
        stale_threshold: Duration::ZERO,
        ..scheduler_config()
    };
    let h = harness_with(RoutedTransport::happy(), StubResearch::default(), config).await;
    let task = h.add_task(5, 3).await;
    let agent = h.add_agent("worker", 1, 5).await;
    assert!(h.db.assign_task(task.id, agent.id).await.unwrap());
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert_eq!(
        h.scheduler.run_iteration().await,
        IterationOutcome::Idle { reclaimed: 1 }
    );
    assert_eq!(h.task(task.id).await.status, TaskStatus::NotStarted);
    assert_eq!(h.agent(agent.id).await.status, AgentStatus::Available);

    // Reclaiming again changes nothing
    let report = h.scheduler.reclaimer().sweep().await.unwrap();
    assert!(report.is_empty());

    // And the task is dispatched on the next pass
    let outcome = h.scheduler.run_iteration().await;
    assert!(matches!(outcome, IterationOutcome::Completed { task_id, .. } if task_id == task.id));
}

#[tokio::test]
async fn startup_recovery_resets_orphans() {
    let h = harness(RoutedTransport::happy()).await;
    let task = h.add_task(5, 3).await;
    let agent = h.add_agent("worker", 1, 5).await;
    h.db.assign_task(task.id, agent.id).await.unwrap();
    h.db.update_task_status(task.id, TaskStatus::Build, 30, "mid-flight", Some(agent.id))
        .await
        .unwrap();

    let report = h.scheduler.recover_orphans().await.unwrap();
    assert_eq!(report.tasks_reset, vec![task.id]);
    assert_eq!(h.task(task.id).await.status, TaskStatus::NotStarted);
    assert_eq!(h.task(task.id).await.stage_progress, 0);
}

#[tokio::test]
async fn run_until_stops_after_shutdown() {
    let h = harness(RoutedTransport::happy()).await;
    let task = h.add_task(5, 3).await;
    h.add_agent("worker", 1, 5).await;

    // Shutdown is already signalled: exactly one iteration runs.
    h.scheduler.run_until(std::future::ready(())).await;
    assert_eq!(h.task(task.id).await.status, TaskStatus::Complete);
}

// ── Store faults ────────────────────────────────────────────────────

#[tokio::test]
async fn store_fault_is_reported_and_next_iteration_recovers() {
    let store = Arc::new(FaultyStore::new().await.fail_selects(1));
    let h = harness_on(
        store.clone(),
        RoutedTransport::happy(),
        StubResearch::default(),
        scheduler_config(),
    );
    let task = h.add_task(5, 3).await;
    h.add_agent("worker", 1, 5).await;

    match h.scheduler.run_iteration().await {
        IterationOutcome::StoreUnavailable { reason } => {
            assert!(reason.contains("database is locked"))
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(h.task(task.id).await.status, TaskStatus::NotStarted);

    let outcome = h.scheduler.run_iteration().await;
    assert!(matches!(outcome, IterationOutcome::Completed { task_id, .. } if task_id == task.id));
}

#[tokio::test]
async fn failed_reset_is_retried_before_new_work() {
    let store = Arc::new(FaultyStore::new().await.fail_resets(2));
    let transport = RoutedTransport::happy().with_queued(prompts::PLANNING_SYSTEM, &[""]);
    let h = harness_on(
        store.clone(),
        transport,
        StubResearch::default(),
        scheduler_config(),
    );
    let task = h.add_task(5, 3).await;
    let agent = h.add_agent("worker", 1, 5).await;

    // The pipeline fails and so does the reset that follows it.
    let outcome = h.scheduler.run_iteration().await;
    assert!(matches!(outcome, IterationOutcome::Failed { task_id, .. } if task_id == task.id));
    assert_eq!(h.task(task.id).await.status, TaskStatus::Design);
    assert_eq!(h.agent(agent.id).await.status, AgentStatus::Busy);

    // The retried reset fails again: nothing new is selected.
    let outcome = h.scheduler.run_iteration().await;
    assert!(matches!(outcome, IterationOutcome::StoreUnavailable { .. }));
    assert_eq!(h.task(task.id).await.status, TaskStatus::Design);

    // The third attempt lands, and the task is picked up again.
    let outcome = h.scheduler.run_iteration().await;
    assert!(matches!(outcome, IterationOutcome::Completed { task_id, .. } if task_id == task.id));
    assert_eq!(h.task(task.id).await.status, TaskStatus::Complete);
    assert_eq!(h.agent(agent.id).await.status, AgentStatus::Available);

    let resets = h
        .db
        .list_updates(task.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|u| u.content.starts_with("Reset after failure"))
        .count();
    assert_eq!(resets, 1);
}

#[tokio::test(start_paused = true)]
async fn loop_backs_off_and_reconnects_while_store_is_down() {
    let store = Arc::new(FaultyStore::new().await.fail_selects(usize::MAX));
    let config = SchedulerConfig {
        poll_interval: Duration::from_secs(1),
        ..scheduler_config()
    };
    let h = harness_on(
        store.clone(),
        RoutedTransport::happy(),
        StubResearch::default(),
        config,
    );

    // Faults at 0s, 2s, 6s, 14s, 22s and 30s; shutdown lands during the
    // sleep that follows.
    h.scheduler
        .run_until(tokio::time::sleep(Duration::from_secs(31)))
        .await;

    let secs = |n| Duration::from_secs(n);
    assert_eq!(
        store.select_gaps(),
        vec![secs(2), secs(4), secs(8), secs(8), secs(8)]
    );
    assert_eq!(store.reconnects.load(Ordering::SeqCst), 2);
}

// ── Gateway ─────────────────────────────────────────────────────────

#[tokio::test]
async fn gateway_tries_primary_n_times_then_fallback_once() {
    let transport = Arc::new(RoutedTransport::happy().without_default(prompts::PLANNING_SYSTEM));
    let policy = RetryPolicy::new(3, 0.0, Duration::from_secs(5))
        .with_fallbacks(FallbackTable::empty().with("big", "small"));
    let gateway = LlmGateway::new(transport.clone(), policy);

    let out = gateway
        .generate(&GenerateRequest::new("big", "plan this").with_system(prompts::PLANNING_SYSTEM))
        .await;
    assert!(out.is_empty());
    assert_eq!(transport.models(), vec!["big", "big", "big", "small"]);
}
