//! Stale-work reclaimer.
//!
//! A busy agent whose `last_active` heartbeat is older than the staleness
//! threshold is assumed hung: its task goes back to `not_started` and the
//! agent back to `available`. Reclaiming an already reclaimed agent is a
//! no-op, so sweeps can run as often as the scheduler likes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::Database;
use crate::tasks::model::{Agent, AgentStatus};

/// What a sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub agents_reclaimed: usize,
    pub tasks_reset: Vec<Uuid>,
}

impl ReclaimReport {
    pub fn is_empty(&self) -> bool {
        self.agents_reclaimed == 0
    }
}

pub struct Reclaimer {
    store: Arc<dyn Database>,
    stale_threshold: Duration,
}

impl Reclaimer {
    pub fn new(store: Arc<dyn Database>, stale_threshold: Duration) -> Self {
        Self {
            store,
            stale_threshold,
        }
    }

    pub fn stale_threshold(&self) -> Duration {
        self.stale_threshold
    }

    /// Reclaim agents that are stale as of now.
    pub async fn sweep(&self) -> Result<ReclaimReport, DatabaseError> {
        self.sweep_at(Utc::now()).await
    }

    /// Reclaim agents that are stale as of `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<ReclaimReport, DatabaseError> {
        let threshold = TimeDelta::from_std(self.stale_threshold).unwrap_or(TimeDelta::MAX);
        let cutoff = now
            .checked_sub_signed(threshold)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let secs = self.stale_threshold.as_secs();
        self.sweep_before(cutoff, |agent| {
            format!(
                "Forced reset: agent {} inactive since {}, past the {secs}s staleness threshold",
                agent.name,
                agent.last_active.to_rfc3339()
            )
        })
        .await
    }

    /// Reclaim every busy agent. Used at startup, when no pipeline from a
    /// previous process can still be running.
    pub async fn recover_all(&self) -> Result<ReclaimReport, DatabaseError> {
        let report = self
            .sweep_before(DateTime::<Utc>::MAX_UTC, |agent| {
                format!(
                    "Forced reset at startup: agent {} was busy when the dispatcher stopped",
                    agent.name
                )
            })
            .await?;
        if !report.is_empty() {
            info!(
                agents = report.agents_reclaimed,
                tasks = report.tasks_reset.len(),
                "Recovered orphaned work from a previous run"
            );
        }
        Ok(report)
    }

    async fn sweep_before<F>(
        &self,
        cutoff: DateTime<Utc>,
        reason: F,
    ) -> Result<ReclaimReport, DatabaseError>
    where
        F: Fn(&Agent) -> String,
    {
        let busy = self.store.list_agents_by_status(AgentStatus::Busy).await?;
        let mut report = ReclaimReport::default();

        for agent in busy.iter().filter(|a| a.last_active < cutoff) {
            match self.store.reclaim_agent(agent.id, cutoff, &reason(agent)).await {
                Ok(Some(reclaimed)) => {
                    warn!(
                        agent = %agent.name,
                        agent_id = %agent.id,
                        task_id = ?reclaimed.task_id,
                        last_active = %agent.last_active,
                        "Reclaimed stale agent"
                    );
                    report.agents_reclaimed += 1;
                    report.tasks_reset.extend(reclaimed.task_id);
                }
                Ok(None) => {
                    debug!(agent_id = %agent.id, "Agent no longer stale; skipped");
                }
                Err(e) => {
                    warn!(agent_id = %agent.id, error = %e, "Failed to reclaim agent");
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;
    use crate::tasks::model::{Task, TaskStatus, UpdateType};

    async fn busy_pair(db: &Arc<dyn Database>) -> (Task, Agent) {
        let task = Task::new("t", "").with_complexity(2);
        let agent = Agent::new("a", "m", 1, 5);
        db.create_task(&task).await.unwrap();
        db.register_agent(&agent).await.unwrap();
        assert!(db.assign_task(task.id, agent.id).await.unwrap());
        (task, agent)
    }

    #[tokio::test]
    async fn fresh_agents_are_left_alone() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let (task, _) = busy_pair(&db).await;

        let reclaimer = Reclaimer::new(db.clone(), Duration::from_secs(1800));
        let report = reclaimer.sweep().await.unwrap();
        assert!(report.is_empty());
        assert_eq!(
            db.get_task(task.id).await.unwrap().unwrap().status,
            TaskStatus::Design
        );
    }

    #[tokio::test]
    async fn stale_agent_is_reclaimed_once() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let (task, agent) = busy_pair(&db).await;

        let reclaimer = Reclaimer::new(db.clone(), Duration::from_secs(60));
        let later = Utc::now() + TimeDelta::hours(2);

        let first = reclaimer.sweep_at(later).await.unwrap();
        assert_eq!(first.agents_reclaimed, 1);
        assert_eq!(first.tasks_reset, vec![task.id]);

        let second = reclaimer.sweep_at(later).await.unwrap();
        assert!(second.is_empty());

        let agent = db.get_agent(agent.id).await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Available);
        let task_row = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task_row.status, TaskStatus::NotStarted);

        let notes: Vec<_> = db
            .list_updates(task.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|u| u.update_type == UpdateType::Note)
            .collect();
        assert_eq!(notes.len(), 1);
        assert!(notes[0].content.contains("staleness threshold"));
    }

    #[tokio::test]
    async fn recover_all_resets_every_busy_agent() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let (task, _) = busy_pair(&db).await;

        let reclaimer = Reclaimer::new(db.clone(), Duration::from_secs(1800));
        let report = reclaimer.recover_all().await.unwrap();
        assert_eq!(report.tasks_reset, vec![task.id]);
        assert!(
            db.list_agents_by_status(AgentStatus::Busy)
                .await
                .unwrap()
                .is_empty()
        );
    }
}
