//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Lifecycle mutations run in a
//! single transaction on the shared connection and are rolled back whenever a
//! precondition fails or a statement errors, so a partially assigned or
//! partially reset task is never visible.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Transaction, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{Database, ReclaimedAgent};
use crate::tasks::model::{
    Agent, AgentStatus, OutputFormat, Task, TaskStatus, TaskUpdate, UpdateType, truncate_content,
};

/// Default cap on stored update content, in characters.
pub const DEFAULT_MAX_UPDATE_CHARS: usize = 2000;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations until
/// `reconnect` swaps it for a fresh one.
pub struct LibSqlBackend {
    db: LibSqlDatabase,
    conn: RwLock<Connection>,
    in_memory: bool,
    max_update_chars: usize,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db, false)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db, true)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase, in_memory: bool) -> Result<Self, DatabaseError> {
        let conn = connect(&db)?;
        Ok(Self {
            db,
            conn: RwLock::new(conn),
            in_memory,
            max_update_chars: DEFAULT_MAX_UPDATE_CHARS,
        })
    }

    /// Builder: cap stored update content at `max` characters.
    pub fn with_max_update_chars(mut self, max: usize) -> Self {
        self.max_update_chars = max;
        self
    }

    /// Handle to the current connection. Clones share the same session.
    fn conn(&self) -> Connection {
        self.conn
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn begin(&self, op: &str) -> Result<Transaction, DatabaseError> {
        self.conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op} begin: {e}")))
    }

    /// Commit or roll back `tx` according to `outcome`.
    async fn finish<T>(
        &self,
        tx: Transaction,
        op: &str,
        outcome: Result<TxOutcome<T>, DatabaseError>,
    ) -> Result<T, DatabaseError> {
        match outcome {
            Ok(TxOutcome::Commit(value)) => {
                if let Err(e) = tx.commit().await {
                    // The transaction may still be open on the shared connection.
                    let _ = self.conn().execute("ROLLBACK", ()).await;
                    return Err(DatabaseError::Query(format!("{op} commit: {e}")));
                }
                Ok(value)
            }
            Ok(TxOutcome::Rollback(value)) => {
                rollback(tx, op).await;
                Ok(value)
            }
            Err(e) => {
                rollback(tx, op).await;
                Err(e)
            }
        }
    }
}

fn connect(db: &LibSqlDatabase) -> Result<Connection, DatabaseError> {
    db.connect()
        .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))
}

/// What to do with a transaction once its body has run.
enum TxOutcome<T> {
    Commit(T),
    Rollback(T),
}

async fn rollback(tx: Transaction, op: &str) {
    if let Err(e) = tx.rollback().await {
        warn!(op, error = %e, "Transaction rollback failed");
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 so lexical order matches chronological order.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_uuid(s: Option<String>) -> Option<Uuid> {
    s.filter(|s| !s.is_empty())
        .and_then(|s| Uuid::parse_str(&s).ok())
}

fn query_err(op: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

const TASK_COLUMNS: &str = "id, title, description, complexity, priority, status, stage_progress, assigned_agent_id, result_path, output_formats, created_at, updated_at, completed_at";

const AGENT_COLUMNS: &str =
    "id, name, model, status, min_complexity, max_complexity, last_active";

const UPDATE_COLUMNS: &str = "id, task_id, agent_id, stage, update_type, content, timestamp";

const ACTIVE_STATUSES: &str = "('design', 'build', 'test', 'review')";

fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let id_str: String = row.get(0).map_err(|e| DatabaseError::Query(format!("task.id: {e}")))?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Query(format!("task.id parse: {e}")))?;

    let title: String = row.get(1).map_err(|e| DatabaseError::Query(format!("task.title: {e}")))?;
    let description: String = row.get(2).unwrap_or_default();
    let complexity: i64 = row.get(3).unwrap_or(1);
    let priority: i64 = row.get(4).unwrap_or(0);

    let status_str: String = row
        .get(5)
        .map_err(|e| DatabaseError::Query(format!("task.status: {e}")))?;
    let status: TaskStatus = status_str
        .parse()
        .map_err(DatabaseError::Serialization)?;

    let progress: i64 = row.get(6).unwrap_or(0);
    let stage_progress = u8::try_from(progress.clamp(0, 100)).unwrap_or(0);

    let assigned_agent_id = parse_optional_uuid(row.get::<String>(7).ok());
    let result_path = row.get::<String>(8).ok().filter(|s| !s.is_empty());

    let formats_str: String = row.get(9).unwrap_or_default();
    let output_formats: BTreeSet<OutputFormat> = serde_json::from_str(&formats_str)
        .unwrap_or_else(|_| BTreeSet::from([OutputFormat::Markdown]));

    let created_str: String = row.get(10).unwrap_or_default();
    let updated_str: String = row.get(11).unwrap_or_default();
    let completed_at = row
        .get::<String>(12)
        .ok()
        .filter(|s| !s.is_empty())
        .map(|s| parse_datetime(&s));

    Ok(Task {
        id,
        title,
        description,
        complexity: i32::try_from(complexity).unwrap_or(i32::MAX),
        priority: i32::try_from(priority).unwrap_or(0),
        status,
        stage_progress,
        assigned_agent_id,
        result_path,
        output_formats,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
        completed_at,
    })
}

fn row_to_agent(row: &libsql::Row) -> Result<Agent, DatabaseError> {
    let id_str: String = row.get(0).map_err(|e| DatabaseError::Query(format!("agent.id: {e}")))?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Query(format!("agent.id parse: {e}")))?;
    let name: String = row.get(1).map_err(|e| DatabaseError::Query(format!("agent.name: {e}")))?;
    let model: String = row.get(2).map_err(|e| DatabaseError::Query(format!("agent.model: {e}")))?;

    let status_str: String = row.get(3).unwrap_or_else(|_| "available".to_string());
    let status: AgentStatus = status_str
        .parse()
        .map_err(DatabaseError::Serialization)?;

    let min_complexity: i64 = row.get(4).unwrap_or(0);
    let max_complexity: i64 = row.get(5).unwrap_or(0);
    let last_active_str: String = row.get(6).unwrap_or_default();

    Ok(Agent {
        id,
        name,
        model,
        status,
        min_complexity: i32::try_from(min_complexity).unwrap_or(i32::MIN),
        max_complexity: i32::try_from(max_complexity).unwrap_or(i32::MAX),
        last_active: parse_datetime(&last_active_str),
    })
}

fn row_to_update(row: &libsql::Row) -> Result<TaskUpdate, DatabaseError> {
    let id_str: String = row.get(0).map_err(|e| DatabaseError::Query(format!("update.id: {e}")))?;
    let task_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("update.task_id: {e}")))?;
    let stage_str: String = row.get(3).unwrap_or_else(|_| "not_started".to_string());
    let type_str: String = row.get(4).unwrap_or_else(|_| "note".to_string());
    let content: String = row.get(5).unwrap_or_default();
    let timestamp_str: String = row.get(6).unwrap_or_default();

    Ok(TaskUpdate {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Query(format!("update.id parse: {e}")))?,
        task_id: Uuid::parse_str(&task_str)
            .map_err(|e| DatabaseError::Query(format!("update.task_id parse: {e}")))?,
        agent_id: parse_optional_uuid(row.get::<String>(2).ok()),
        stage: stage_str.parse().map_err(DatabaseError::Serialization)?,
        update_type: type_str.parse().map_err(DatabaseError::Serialization)?,
        content,
        timestamp: parse_datetime(&timestamp_str),
    })
}

// ── Statement helpers (usable inside a transaction) ─────────────────

async fn load_task(conn: &Connection, id: Uuid, op: &str) -> Result<Option<Task>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![id.to_string()],
        )
        .await
        .map_err(query_err(op))?;

    match rows.next().await.map_err(query_err(op))? {
        Some(row) => Ok(Some(row_to_task(&row)?)),
        None => Ok(None),
    }
}

async fn load_agent(
    conn: &Connection,
    id: Uuid,
    op: &str,
) -> Result<Option<Agent>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"),
            params![id.to_string()],
        )
        .await
        .map_err(query_err(op))?;

    match rows.next().await.map_err(query_err(op))? {
        Some(row) => Ok(Some(row_to_agent(&row)?)),
        None => Ok(None),
    }
}

async fn collect_tasks(mut rows: libsql::Rows, op: &str) -> Result<Vec<Task>, DatabaseError> {
    let mut tasks = Vec::new();
    while let Some(row) = rows.next().await.map_err(query_err(op))? {
        tasks.push(row_to_task(&row)?);
    }
    Ok(tasks)
}

async fn collect_agents(mut rows: libsql::Rows, op: &str) -> Result<Vec<Agent>, DatabaseError> {
    let mut agents = Vec::new();
    while let Some(row) = rows.next().await.map_err(query_err(op))? {
        agents.push(row_to_agent(&row)?);
    }
    Ok(agents)
}

/// Return `task` to the queue and free its agent.
async fn reset_rows(conn: &Connection, task: &Task, now: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE tasks SET status = 'not_started', stage_progress = 0, assigned_agent_id = NULL, updated_at = ?1 WHERE id = ?2",
        params![now, task.id.to_string()],
    )
    .await
    .map_err(query_err("reset task"))?;

    if let Some(agent_id) = task.assigned_agent_id {
        conn.execute(
            "UPDATE agents SET status = 'available', last_active = ?1 WHERE id = ?2",
            params![now, agent_id.to_string()],
        )
        .await
        .map_err(query_err("reset agent"))?;
    }
    Ok(())
}

struct NewUpdate<'a> {
    task_id: Uuid,
    agent_id: Option<Uuid>,
    stage: TaskStatus,
    update_type: UpdateType,
    content: &'a str,
}

async fn insert_update(
    conn: &Connection,
    update: NewUpdate<'_>,
    max_chars: usize,
) -> Result<TaskUpdate, DatabaseError> {
    let entry = TaskUpdate {
        id: Uuid::new_v4(),
        task_id: update.task_id,
        agent_id: update.agent_id,
        stage: update.stage,
        update_type: update.update_type,
        content: truncate_content(update.content, max_chars),
        timestamp: Utc::now(),
    };

    conn.execute(
        &format!("INSERT INTO task_updates ({UPDATE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
        params![
            entry.id.to_string(),
            entry.task_id.to_string(),
            entry.agent_id.map(|id| id.to_string()),
            entry.stage.as_str(),
            entry.update_type.as_str(),
            entry.content.as_str(),
            fmt_ts(entry.timestamp),
        ],
    )
    .await
    .map_err(query_err("insert_update"))?;
    Ok(entry)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(&self.conn()).await
    }

    async fn reconnect(&self) -> Result<(), DatabaseError> {
        if self.in_memory {
            // A second connection to `:memory:` would open an empty database.
            debug!("In-memory database keeps its connection");
            return Ok(());
        }
        let fresh = connect(&self.db)?;
        *self
            .conn
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = fresh;
        info!("Database connection re-established");
        Ok(())
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn create_task(&self, task: &Task) -> Result<(), DatabaseError> {
        if task.stage_progress > 100 {
            return Err(DatabaseError::Constraint(format!(
                "stage_progress {} exceeds 100",
                task.stage_progress
            )));
        }
        let formats = serde_json::to_string(&task.output_formats)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    task.id.to_string(),
                    task.title.as_str(),
                    task.description.as_str(),
                    i64::from(task.complexity),
                    i64::from(task.priority),
                    task.status.as_str(),
                    i64::from(task.stage_progress),
                    task.assigned_agent_id.map(|id| id.to_string()),
                    task.result_path.as_deref(),
                    formats,
                    fmt_ts(task.created_at),
                    fmt_ts(task.updated_at),
                    task.completed_at.map(fmt_ts),
                ],
            )
            .await
            .map_err(query_err("create_task"))?;
        debug!(task_id = %task.id, "Task created");
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        load_task(&self.conn(), id, "get_task").await
    }

    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY priority DESC, created_at ASC, id ASC"
                ),
                params![status.as_str()],
            )
            .await
            .map_err(query_err("list_tasks_by_status"))?;
        collect_tasks(rows, "list_tasks_by_status").await
    }

    async fn next_eligible_task(&self) -> Result<Option<Task>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'not_started' ORDER BY priority DESC, created_at ASC, id ASC LIMIT 1"
                ),
                (),
            )
            .await
            .map_err(query_err("next_eligible_task"))?;
        Ok(collect_tasks(rows, "next_eligible_task")
            .await?
            .into_iter()
            .next())
    }

    async fn set_result_path(&self, task_id: Uuid, path: &str) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE tasks SET result_path = ?1, updated_at = ?2 WHERE id = ?3",
                params![path, fmt_ts(Utc::now()), task_id.to_string()],
            )
            .await
            .map_err(query_err("set_result_path"))?;
        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "task".into(),
                id: task_id.to_string(),
            });
        }
        Ok(())
    }

    // ── Agents ──────────────────────────────────────────────────────

    async fn register_agent(&self, agent: &Agent) -> Result<(), DatabaseError> {
        if !agent.has_valid_band() {
            return Err(DatabaseError::Constraint(format!(
                "agent {} has min_complexity {} > max_complexity {}",
                agent.name, agent.min_complexity, agent.max_complexity
            )));
        }

        self.conn()
            .execute(
                &format!("INSERT INTO agents ({AGENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                params![
                    agent.id.to_string(),
                    agent.name.as_str(),
                    agent.model.as_str(),
                    agent.status.as_str(),
                    i64::from(agent.min_complexity),
                    i64::from(agent.max_complexity),
                    fmt_ts(agent.last_active),
                ],
            )
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("UNIQUE") {
                    DatabaseError::Constraint(format!("agent name '{}' already registered", agent.name))
                } else {
                    DatabaseError::Query(format!("register_agent: {msg}"))
                }
            })?;
        info!(agent = %agent.name, model = %agent.model, "Agent registered");
        Ok(())
    }

    async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>, DatabaseError> {
        load_agent(&self.conn(), id, "get_agent").await
    }

    async fn find_agent_by_name(&self, name: &str) -> Result<Option<Agent>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE name = ?1"),
                params![name],
            )
            .await
            .map_err(query_err("find_agent_by_name"))?;
        Ok(collect_agents(rows, "find_agent_by_name")
            .await?
            .into_iter()
            .next())
    }

    async fn list_agents_by_status(
        &self,
        status: AgentStatus,
    ) -> Result<Vec<Agent>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {AGENT_COLUMNS} FROM agents WHERE status = ?1 ORDER BY last_active ASC, name ASC"
                ),
                params![status.as_str()],
            )
            .await
            .map_err(query_err("list_agents_by_status"))?;
        collect_agents(rows, "list_agents_by_status").await
    }

    async fn available_agent_for(&self, complexity: i32) -> Result<Option<Agent>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {AGENT_COLUMNS} FROM agents \
                     WHERE status = 'available' AND min_complexity <= ?1 AND max_complexity >= ?1 \
                     ORDER BY last_active ASC, name ASC LIMIT 1"
                ),
                params![i64::from(complexity)],
            )
            .await
            .map_err(query_err("available_agent_for"))?;
        Ok(collect_agents(rows, "available_agent_for")
            .await?
            .into_iter()
            .next())
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    async fn assign_task(&self, task_id: Uuid, agent_id: Uuid) -> Result<bool, DatabaseError> {
        const OP: &str = "assign_task";
        let tx = self.begin(OP).await?;

        let outcome: Result<TxOutcome<_>, DatabaseError> = async {
            let Some(task) = load_task(&tx, task_id, OP).await? else {
                return Ok(TxOutcome::Rollback(false));
            };
            let Some(agent) = load_agent(&tx, agent_id, OP).await? else {
                return Ok(TxOutcome::Rollback(false));
            };
            if task.status != TaskStatus::NotStarted
                || agent.status != AgentStatus::Available
                || !agent.accepts(task.complexity)
            {
                return Ok(TxOutcome::Rollback(false));
            }

            let now = fmt_ts(Utc::now());
            let claimed = tx
                .execute(
                    "UPDATE tasks SET status = 'design', stage_progress = 0, assigned_agent_id = ?1, updated_at = ?2 WHERE id = ?3 AND status = 'not_started'",
                    params![agent_id.to_string(), now.as_str(), task_id.to_string()],
                )
                .await
                .map_err(query_err(OP))?;
            let reserved = tx
                .execute(
                    "UPDATE agents SET status = 'busy', last_active = ?1 WHERE id = ?2 AND status = 'available'",
                    params![now.as_str(), agent_id.to_string()],
                )
                .await
                .map_err(query_err(OP))?;
            if claimed != 1 || reserved != 1 {
                return Ok(TxOutcome::Rollback(false));
            }

            insert_update(
                &tx,
                NewUpdate {
                    task_id,
                    agent_id: Some(agent_id),
                    stage: TaskStatus::Design,
                    update_type: UpdateType::StatusChange,
                    content: &format!("Assigned to agent {} ({})", agent.name, agent.model),
                },
                self.max_update_chars,
            )
            .await?;
            Ok(TxOutcome::Commit(true))
        }
        .await;

        let assigned = self.finish(tx, OP, outcome).await?;
        if assigned {
            info!(task_id = %task_id, agent_id = %agent_id, "Task assigned");
        }
        Ok(assigned)
    }

    async fn update_task_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        progress: u8,
        message: &str,
        agent_id: Option<Uuid>,
    ) -> Result<bool, DatabaseError> {
        const OP: &str = "update_task_status";
        if progress > 100 {
            return Err(DatabaseError::Constraint(format!(
                "progress {progress} exceeds 100"
            )));
        }
        let tx = self.begin(OP).await?;

        let outcome: Result<TxOutcome<_>, DatabaseError> = async {
            let Some(task) = load_task(&tx, task_id, OP).await? else {
                return Ok(TxOutcome::Rollback(false));
            };
            if agent_id.is_some() && task.assigned_agent_id != agent_id {
                return Ok(TxOutcome::Rollback(false));
            }
            // Leaving the queue goes through assign_task so an agent is always attached.
            if task.status == TaskStatus::NotStarted || !task.status.can_transition_to(status) {
                return Err(DatabaseError::InvalidTransition {
                    task_id,
                    from: task.status.to_string(),
                    to: status.to_string(),
                });
            }

            let now = fmt_ts(Utc::now());
            let owner = task.assigned_agent_id;
            match status {
                TaskStatus::NotStarted => {
                    reset_rows(&tx, &task, &now).await?;
                }
                TaskStatus::Complete => {
                    tx.execute(
                        "UPDATE tasks SET status = 'complete', stage_progress = ?1, assigned_agent_id = NULL, completed_at = ?2, updated_at = ?2 WHERE id = ?3",
                        params![i64::from(progress), now.as_str(), task_id.to_string()],
                    )
                    .await
                    .map_err(query_err(OP))?;
                    if let Some(owner) = owner {
                        tx.execute(
                            "UPDATE agents SET status = 'available', last_active = ?1 WHERE id = ?2",
                            params![now.as_str(), owner.to_string()],
                        )
                        .await
                        .map_err(query_err(OP))?;
                    }
                }
                _ => {
                    tx.execute(
                        "UPDATE tasks SET status = ?1, stage_progress = ?2, updated_at = ?3 WHERE id = ?4",
                        params![status.as_str(), i64::from(progress), now.as_str(), task_id.to_string()],
                    )
                    .await
                    .map_err(query_err(OP))?;
                    if let Some(owner) = owner {
                        tx.execute(
                            "UPDATE agents SET last_active = ?1 WHERE id = ?2",
                            params![now.as_str(), owner.to_string()],
                        )
                        .await
                        .map_err(query_err(OP))?;
                    }
                }
            }

            let update_type = if status == task.status {
                UpdateType::ProgressUpdate
            } else {
                UpdateType::StatusChange
            };
            insert_update(
                &tx,
                NewUpdate {
                    task_id,
                    agent_id: agent_id.or(owner),
                    stage: status,
                    update_type,
                    content: message,
                },
                self.max_update_chars,
            )
            .await?;
            Ok(TxOutcome::Commit(true))
        }
        .await;

        let updated = self.finish(tx, OP, outcome).await?;
        if updated {
            debug!(task_id = %task_id, status = %status, progress, "Task status updated");
        }
        Ok(updated)
    }

    async fn reset_task(&self, task_id: Uuid, reason: &str) -> Result<bool, DatabaseError> {
        const OP: &str = "reset_task";
        let tx = self.begin(OP).await?;

        let outcome: Result<TxOutcome<_>, DatabaseError> = async {
            let Some(task) = load_task(&tx, task_id, OP).await? else {
                return Ok(TxOutcome::Rollback(false));
            };
            if !task.status.is_active() {
                return Ok(TxOutcome::Rollback(false));
            }

            let now = fmt_ts(Utc::now());
            reset_rows(&tx, &task, &now).await?;
            insert_update(
                &tx,
                NewUpdate {
                    task_id,
                    agent_id: task.assigned_agent_id,
                    stage: TaskStatus::NotStarted,
                    update_type: UpdateType::StatusChange,
                    content: reason,
                },
                self.max_update_chars,
            )
            .await?;
            Ok(TxOutcome::Commit(true))
        }
        .await;

        let reset = self.finish(tx, OP, outcome).await?;
        if reset {
            info!(task_id = %task_id, reason, "Task reset to not_started");
        }
        Ok(reset)
    }

    async fn reclaim_agent(
        &self,
        agent_id: Uuid,
        stale_before: DateTime<Utc>,
        reason: &str,
    ) -> Result<Option<ReclaimedAgent>, DatabaseError> {
        const OP: &str = "reclaim_agent";
        let tx = self.begin(OP).await?;

        let outcome: Result<TxOutcome<_>, DatabaseError> = async {
            let Some(agent) = load_agent(&tx, agent_id, OP).await? else {
                return Ok(TxOutcome::Rollback(None));
            };
            if agent.status != AgentStatus::Busy || agent.last_active >= stale_before {
                return Ok(TxOutcome::Rollback(None));
            }

            let rows = tx
                .query(
                    &format!(
                        "SELECT {TASK_COLUMNS} FROM tasks WHERE assigned_agent_id = ?1 AND status IN {ACTIVE_STATUSES} LIMIT 1"
                    ),
                    params![agent_id.to_string()],
                )
                .await
                .map_err(query_err(OP))?;
            let owned = collect_tasks(rows, OP).await?.into_iter().next();

            let now = fmt_ts(Utc::now());
            match &owned {
                Some(task) => {
                    reset_rows(&tx, task, &now).await?;
                    insert_update(
                        &tx,
                        NewUpdate {
                            task_id: task.id,
                            agent_id: Some(agent_id),
                            stage: TaskStatus::NotStarted,
                            update_type: UpdateType::Note,
                            content: reason,
                        },
                        self.max_update_chars,
                    )
                    .await?;
                }
                None => {
                    tx.execute(
                        "UPDATE agents SET status = 'available', last_active = ?1 WHERE id = ?2",
                        params![now.as_str(), agent_id.to_string()],
                    )
                    .await
                    .map_err(query_err(OP))?;
                }
            }

            Ok(TxOutcome::Commit(Some(ReclaimedAgent {
                agent_id,
                task_id: owned.map(|t| t.id),
            })))
        }
        .await;

        self.finish(tx, OP, outcome).await
    }

    // ── Task updates ────────────────────────────────────────────────

    async fn append_update(
        &self,
        task_id: Uuid,
        agent_id: Option<Uuid>,
        update_type: UpdateType,
        content: &str,
    ) -> Result<TaskUpdate, DatabaseError> {
        let task = load_task(&self.conn(), task_id, "append_update")
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "task".into(),
                id: task_id.to_string(),
            })?;

        insert_update(
            &self.conn(),
            NewUpdate {
                task_id,
                agent_id,
                stage: task.status,
                update_type,
                content,
            },
            self.max_update_chars,
        )
        .await
    }

    async fn list_updates(&self, task_id: Uuid) -> Result<Vec<TaskUpdate>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {UPDATE_COLUMNS} FROM task_updates WHERE task_id = ?1 ORDER BY timestamp ASC, rowid ASC"
                ),
                params![task_id.to_string()],
            )
            .await
            .map_err(query_err("list_updates"))?;

        let mut updates = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_updates"))? {
            updates.push(row_to_update(&row)?);
        }
        Ok(updates)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
