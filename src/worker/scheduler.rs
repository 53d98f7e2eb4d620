//! Scheduler: the dispatch control loop.
//!
//! One iteration:
//! 1. Take the next eligible task; none → run the reclaimer, sleep
//! 2. Find an available agent whose band fits; none → run the reclaimer, sleep
//! 3. Assign atomically
//! 4. Run the pipeline in its own tokio task under a deadline
//! 5. On any failure reset the task and free the agent
//!
//! A single task is in flight at a time. Store faults never end the loop;
//! the sleep backs off instead, and repeated faults reconnect the store. A
//! reset that fails is retried before any new work is selected.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::DatabaseError;
use crate::pipeline::PhasePipeline;
use crate::store::Database;
use crate::tasks::model::{Agent, Task};
use crate::worker::reclaimer::{ReclaimReport, Reclaimer};

/// Upper bound on the store-fault backoff, as a multiple of the poll interval.
const MAX_BACKOFF_FACTOR: u32 = 8;

/// Consecutive store faults between reconnect attempts.
const RECONNECT_AFTER_FAULTS: u32 = 3;

/// What one scheduler iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Queue empty.
    Idle { reclaimed: usize },
    /// No available agent covers the task's complexity.
    NoAgent { task_id: Uuid, reclaimed: usize },
    /// The task or agent changed between selection and assignment.
    AssignmentConflict { task_id: Uuid },
    Completed { task_id: Uuid, agent_id: Uuid },
    /// The pipeline failed and the task was reset.
    Failed {
        task_id: Uuid,
        agent_id: Uuid,
        reason: String,
    },
    StoreUnavailable { reason: String },
}

/// Sleep multiplier driven by consecutive store faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreBackoff {
    factor: u32,
    consecutive_faults: u32,
}

impl Default for StoreBackoff {
    fn default() -> Self {
        Self {
            factor: 1,
            consecutive_faults: 0,
        }
    }
}

impl StoreBackoff {
    /// Multiple of the poll interval to sleep before the next iteration.
    pub fn factor(&self) -> u32 {
        self.factor
    }

    /// Fold in one iteration's outcome. Returns `true` when the store
    /// should reconnect before the next iteration.
    pub fn record(&mut self, outcome: &IterationOutcome) -> bool {
        match outcome {
            IterationOutcome::StoreUnavailable { .. } => {
                self.factor = (self.factor * 2).min(MAX_BACKOFF_FACTOR);
                self.consecutive_faults += 1;
                self.consecutive_faults % RECONNECT_AFTER_FAULTS == 0
            }
            _ => {
                *self = Self::default();
                false
            }
        }
    }
}

/// A reset the store refused; retried at the start of the next iteration.
#[derive(Debug)]
struct PendingReset {
    task_id: Uuid,
    reason: String,
}

pub struct Scheduler {
    store: Arc<dyn Database>,
    pipeline: PhasePipeline,
    reclaimer: Reclaimer,
    config: SchedulerConfig,
    pending_reset: Mutex<Option<PendingReset>>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Database>, pipeline: PhasePipeline, config: SchedulerConfig) -> Self {
        let reclaimer = Reclaimer::new(store.clone(), config.stale_threshold);
        Self {
            store,
            pipeline,
            reclaimer,
            config,
            pending_reset: Mutex::new(None),
        }
    }

    pub fn reclaimer(&self) -> &Reclaimer {
        &self.reclaimer
    }

    /// Reset work orphaned by a previous process.
    pub async fn recover_orphans(&self) -> Result<ReclaimReport, DatabaseError> {
        self.reclaimer.recover_all().await
    }

    /// Run a single iteration (without the trailing sleep).
    pub async fn run_iteration(&self) -> IterationOutcome {
        if let Some(outcome) = self.retry_pending_reset().await {
            return outcome;
        }

        let task = match self.store.next_eligible_task().await {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!("No eligible tasks");
                return IterationOutcome::Idle {
                    reclaimed: self.reclaim().await,
                };
            }
            Err(e) => return store_unavailable(e),
        };

        let agent = match self.store.available_agent_for(task.complexity).await {
            Ok(Some(agent)) => agent,
            Ok(None) => {
                info!(
                    task_id = %task.id,
                    complexity = task.complexity,
                    "No available agent for task"
                );
                return IterationOutcome::NoAgent {
                    task_id: task.id,
                    reclaimed: self.reclaim().await,
                };
            }
            Err(e) => return store_unavailable(e),
        };

        match self.store.assign_task(task.id, agent.id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    task_id = %task.id,
                    agent_id = %agent.id,
                    "Assignment lost a race; retrying next iteration"
                );
                return IterationOutcome::AssignmentConflict { task_id: task.id };
            }
            Err(e) => return store_unavailable(e),
        }

        info!(
            task_id = %task.id,
            title = %task.title,
            priority = task.priority,
            agent = %agent.name,
            "Dispatching task"
        );
        self.execute(task, agent).await
    }

    /// Run the pipeline for an assigned task and reconcile the result.
    async fn execute(&self, task: Task, agent: Agent) -> IterationOutcome {
        let pipeline = self.pipeline.clone();
        let (run_task, run_agent) = (task.clone(), agent.clone());
        let mut handle = tokio::spawn(async move { pipeline.run(&run_task, &run_agent).await });

        let waited = tokio::time::timeout(self.config.pipeline_deadline, &mut handle).await;
        let reason = match waited {
            Ok(Ok(Ok(report))) => {
                info!(
                    task_id = %task.id,
                    output = %report.output_path.display(),
                    revised = report.revised,
                    "Task completed"
                );
                return IterationOutcome::Completed {
                    task_id: task.id,
                    agent_id: agent.id,
                };
            }
            Ok(Ok(Err(e))) => e.to_string(),
            Ok(Err(join_error)) if join_error.is_panic() => "Pipeline panicked".to_string(),
            Ok(Err(join_error)) => format!("Pipeline was cancelled: {join_error}"),
            Err(_) => {
                handle.abort();
                // Let the aborted run unwind before the reset touches the store.
                let _ = handle.await;
                format!(
                    "Pipeline exceeded its {:?} deadline",
                    self.config.pipeline_deadline
                )
            }
        };

        error!(task_id = %task.id, agent_id = %agent.id, reason = %reason, "Pipeline failed");
        let reset_reason = format!("Reset after failure: {reason}");
        match self.store.reset_task(task.id, &reset_reason).await {
            Ok(true) => {}
            Ok(false) => debug!(task_id = %task.id, "Task was already reset"),
            Err(e) => {
                error!(
                    task_id = %task.id,
                    error = %e,
                    "Failed to reset task; retrying next iteration"
                );
                *self.pending() = Some(PendingReset {
                    task_id: task.id,
                    reason: reset_reason,
                });
            }
        }

        IterationOutcome::Failed {
            task_id: task.id,
            agent_id: agent.id,
            reason,
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, Option<PendingReset>> {
        self.pending_reset
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply a reset deferred by a store fault. `Some` ends the iteration.
    async fn retry_pending_reset(&self) -> Option<IterationOutcome> {
        let pending = self.pending().take()?;
        match self.store.reset_task(pending.task_id, &pending.reason).await {
            Ok(reset) => {
                info!(task_id = %pending.task_id, reset, "Deferred reset applied");
                None
            }
            Err(e) => {
                *self.pending() = Some(pending);
                Some(store_unavailable(e))
            }
        }
    }

    async fn reclaim(&self) -> usize {
        match self.reclaimer.sweep().await {
            Ok(report) => report.agents_reclaimed,
            Err(e) => {
                warn!(error = %e, "Reclaim sweep failed");
                0
            }
        }
    }

    /// Loop until `shutdown` resolves. Shutdown is only observed between
    /// iterations; a running pipeline always finishes first.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(
            interval_secs = self.config.poll_interval.as_secs(),
            "Scheduler loop started"
        );

        let mut backoff = StoreBackoff::default();
        loop {
            let outcome = self.run_iteration().await;
            let reconnect = backoff.record(&outcome);
            if let IterationOutcome::StoreUnavailable { reason } = &outcome {
                warn!(
                    reason = %reason,
                    backoff = backoff.factor(),
                    "Store unavailable; backing off"
                );
            }
            if reconnect {
                match self.store.reconnect().await {
                    Ok(()) => info!("Store reconnected after repeated faults"),
                    Err(e) => warn!(error = %e, "Store reconnect failed"),
                }
            }
            let delay = self.config.poll_interval.saturating_mul(backoff.factor());

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Scheduler loop stopping");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn store_unavailable(e: DatabaseError) -> IterationOutcome {
    error!(error = %e, "Store error during scheduling");
    IterationOutcome::StoreUnavailable {
        reason: e.to_string(),
    }
}

/// Spawn the scheduler loop; it stops after `shutdown` resolves.
pub fn spawn_scheduler_loop<F>(scheduler: Arc<Scheduler>, shutdown: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move { scheduler.run_until(shutdown).await })
}

/// Poll interval as given on the command line, if any.
pub fn poll_interval_arg(arg: Option<&str>) -> Option<Duration> {
    arg.and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_interval_arg_parses_seconds() {
        assert_eq!(poll_interval_arg(Some("5")), Some(Duration::from_secs(5)));
        assert_eq!(poll_interval_arg(Some("0")), None);
        assert_eq!(poll_interval_arg(Some("soon")), None);
        assert_eq!(poll_interval_arg(None), None);
    }

    fn fault() -> IterationOutcome {
        IterationOutcome::StoreUnavailable {
            reason: "database is locked".into(),
        }
    }

    #[test]
    fn store_faults_double_the_sleep_up_to_the_cap() {
        let mut backoff = StoreBackoff::default();
        let factors: Vec<u32> = (0..5)
            .map(|_| {
                backoff.record(&fault());
                backoff.factor()
            })
            .collect();
        assert_eq!(factors, vec![2, 4, 8, 8, 8]);
    }

    #[test]
    fn healthy_iteration_resets_backoff() {
        let mut backoff = StoreBackoff::default();
        backoff.record(&fault());
        backoff.record(&fault());
        assert!(!backoff.record(&IterationOutcome::Idle { reclaimed: 0 }));
        assert_eq!(backoff, StoreBackoff::default());
        assert_eq!(backoff.factor(), 1);
    }

    #[test]
    fn reconnect_requested_every_few_consecutive_faults() {
        let mut backoff = StoreBackoff::default();
        let reconnects: Vec<bool> = (0..6).map(|_| backoff.record(&fault())).collect();
        assert_eq!(reconnects, vec![false, false, true, false, false, true]);

        // A healthy iteration restarts the count.
        backoff.record(&IterationOutcome::Idle { reclaimed: 0 });
        assert!(!backoff.record(&fault()));
    }
}
