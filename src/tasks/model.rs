//! Task, agent and task-update data model.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a task.
///
/// The active stages run in a fixed order, each mapped to one pipeline
/// phase: `design` (planning), `build` (research), `test` (execution),
/// `review` (review).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued, no agent attached. Initial and reset state.
    NotStarted,
    Design,
    Build,
    Test,
    Review,
    /// Terminal.
    Complete,
}

impl TaskStatus {
    /// Active stages in pipeline order.
    pub const STAGES: [TaskStatus; 4] = [Self::Design, Self::Build, Self::Test, Self::Review];

    /// Whether an agent is attached while the task is in this status.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Design | Self::Build | Self::Test | Self::Review)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete)
    }

    /// The status that follows this one on success.
    pub fn next(&self) -> Option<TaskStatus> {
        match self {
            Self::NotStarted => Some(Self::Design),
            Self::Design => Some(Self::Build),
            Self::Build => Some(Self::Test),
            Self::Test => Some(Self::Review),
            Self::Review => Some(Self::Complete),
            Self::Complete => None,
        }
    }

    /// Check if this status allows transitioning to `target`.
    ///
    /// Staying in the same active stage is allowed (progress updates), as is
    /// the reset edge from any active stage back to `not_started`.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        if self.is_active() && (target == *self || target == Self::NotStarted) {
            return true;
        }
        self.next() == Some(target)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Design => "design",
            Self::Build => "build",
            Self::Test => "test",
            Self::Review => "review",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "design" => Ok(Self::Design),
            "build" => Ok(Self::Build),
            "test" => Ok(Self::Test),
            "review" => Ok(Self::Review),
            "complete" => Ok(Self::Complete),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Requested output format for the primary artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Markdown,
    Html,
    Text,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Markdown => "md",
            Self::Html => "html",
            Self::Text => "txt",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Markdown => "markdown",
            Self::Html => "html",
            Self::Text => "text",
        };
        f.write_str(s)
    }
}

/// A unit of requested work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    /// Compared against an agent's complexity band.
    pub complexity: i32,
    /// Higher is picked first.
    pub priority: i32,
    pub status: TaskStatus,
    /// Progress within the current stage, 0-100.
    pub stage_progress: u8,
    /// Set iff `status` is an active stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_agent_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
    pub output_formats: BTreeSet<OutputFormat>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new queued task with markdown output.
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: description.into(),
            complexity: 1,
            priority: 0,
            status: TaskStatus::NotStarted,
            stage_progress: 0,
            assigned_agent_id: None,
            result_path: None,
            output_formats: BTreeSet::from([OutputFormat::Markdown]),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn with_complexity(mut self, complexity: i32) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: add a requested output format.
    pub fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.output_formats.insert(format);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.updated_at = created_at;
        self
    }

    /// Formats other than markdown, which is always produced.
    pub fn secondary_formats(&self) -> impl Iterator<Item = OutputFormat> + '_ {
        self.output_formats
            .iter()
            .copied()
            .filter(|f| *f != OutputFormat::Markdown)
    }
}

/// Agent availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Available,
    Busy,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Busy => "busy",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(Self::Available),
            "busy" => Ok(Self::Busy),
            other => Err(format!("unknown agent status: {other}")),
        }
    }
}

/// A capability-bounded worker identity bound to one backing model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    /// Identifier of the backing LLM.
    pub model: String,
    pub status: AgentStatus,
    pub min_complexity: i32,
    pub max_complexity: i32,
    pub last_active: DateTime<Utc>,
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        model: impl Into<String>,
        min_complexity: i32,
        max_complexity: i32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            model: model.into(),
            status: AgentStatus::Available,
            min_complexity,
            max_complexity,
            last_active: Utc::now(),
        }
    }

    pub fn with_last_active(mut self, last_active: DateTime<Utc>) -> Self {
        self.last_active = last_active;
        self
    }

    /// Whether the inclusive complexity band contains `complexity`.
    pub fn accepts(&self, complexity: i32) -> bool {
        self.min_complexity <= complexity && complexity <= self.max_complexity
    }

    pub fn has_valid_band(&self) -> bool {
        self.min_complexity <= self.max_complexity
    }
}

/// Kind of audit-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    StatusChange,
    ProgressUpdate,
    Note,
}

impl UpdateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StatusChange => "status_change",
            Self::ProgressUpdate => "progress_update",
            Self::Note => "note",
        }
    }
}

impl FromStr for UpdateType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "status_change" => Ok(Self::StatusChange),
            "progress_update" => Ok(Self::ProgressUpdate),
            "note" => Ok(Self::Note),
            other => Err(format!("unknown update type: {other}")),
        }
    }
}

/// Append-only audit entry for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub id: Uuid,
    pub task_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<Uuid>,
    /// Task status when the entry was written.
    pub stage: TaskStatus,
    pub update_type: UpdateType,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Truncate `s` to at most `max` characters, appending an ellipsis when cut.
pub fn truncate_content(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push_str("...");
    out
}
