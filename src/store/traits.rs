//! Unified `Database` trait: single async interface for all persistence.
//!
//! Every multi-row mutation (assignment, status change, reset, reclaim) is
//! transactional in the backend: either all rows change or none do.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::tasks::model::{Agent, AgentStatus, Task, TaskStatus, TaskUpdate, UpdateType};

/// Result of reclaiming a stale agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimedAgent {
    pub agent_id: Uuid,
    /// The task that was reset, if the agent still owned one.
    pub task_id: Option<Uuid>,
}

/// Backend-agnostic database trait covering tasks, agents and task updates.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// Drop the current connection and open a fresh one.
    ///
    /// Called by the scheduler after repeated store faults. Backends without
    /// a reconnectable session keep the default no-op.
    async fn reconnect(&self) -> Result<(), DatabaseError> {
        Ok(())
    }

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a new task.
    async fn create_task(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Get a task by ID.
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// List tasks in a status, highest priority first, then oldest.
    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DatabaseError>;

    /// The highest-priority, then oldest, `not_started` task.
    async fn next_eligible_task(&self) -> Result<Option<Task>, DatabaseError>;

    /// Record where the primary artifact was written.
    async fn set_result_path(&self, task_id: Uuid, path: &str) -> Result<(), DatabaseError>;

    // ── Agents ──────────────────────────────────────────────────────

    /// Register a new agent. Rejects an inverted complexity band.
    async fn register_agent(&self, agent: &Agent) -> Result<(), DatabaseError>;

    async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>, DatabaseError>;

    async fn find_agent_by_name(&self, name: &str) -> Result<Option<Agent>, DatabaseError>;

    async fn list_agents_by_status(&self, status: AgentStatus)
    -> Result<Vec<Agent>, DatabaseError>;

    /// Any available agent whose band contains `complexity`.
    ///
    /// Least recently active first, so work spreads across agents.
    async fn available_agent_for(&self, complexity: i32) -> Result<Option<Agent>, DatabaseError>;

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Atomically move the task into the first stage and mark the agent busy.
    ///
    /// Returns `false` with nothing written when the task is not queued, the
    /// agent is not available, or the agent's band excludes the task.
    async fn assign_task(&self, task_id: Uuid, agent_id: Uuid) -> Result<bool, DatabaseError>;

    /// Atomically update status and progress and append an update entry.
    ///
    /// Becoming `complete` stamps `completed_at` and frees the agent. Becoming
    /// `not_started` takes the reset path. Returns `false` when the task is
    /// missing or is no longer assigned to `agent_id`.
    async fn update_task_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        progress: u8,
        message: &str,
        agent_id: Option<Uuid>,
    ) -> Result<bool, DatabaseError>;

    /// Atomically return an active task to `not_started` and free its agent.
    ///
    /// Returns `false` (no-op) when the task is not in an active stage.
    async fn reset_task(&self, task_id: Uuid, reason: &str) -> Result<bool, DatabaseError>;

    /// Atomically reclaim a busy agent whose `last_active` is before
    /// `stale_before`, resetting the task it owns.
    ///
    /// Returns `None` (no-op) when the agent is available or not stale.
    async fn reclaim_agent(
        &self,
        agent_id: Uuid,
        stale_before: DateTime<Utc>,
        reason: &str,
    ) -> Result<Option<ReclaimedAgent>, DatabaseError>;

    // ── Task updates ────────────────────────────────────────────────

    /// Append an entry to the task's audit log without changing its status.
    async fn append_update(
        &self,
        task_id: Uuid,
        agent_id: Option<Uuid>,
        update_type: UpdateType,
        content: &str,
    ) -> Result<TaskUpdate, DatabaseError>;

    /// Append an informational note.
    async fn record_note(
        &self,
        task_id: Uuid,
        agent_id: Option<Uuid>,
        content: &str,
    ) -> Result<TaskUpdate, DatabaseError> {
        self.append_update(task_id, agent_id, UpdateType::Note, content)
            .await
    }

    /// All updates for a task, oldest first.
    async fn list_updates(&self, task_id: Uuid) -> Result<Vec<TaskUpdate>, DatabaseError>;
}
