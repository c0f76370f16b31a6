//! Scheduled-task ticker
//!
//! A single logical loop that wakes every 30 seconds (or sooner, at the next
//! `next_run_at`), scans enabled tasks whose time has come, and hands each to
//! the dispatcher. A task whose `last_status` is `running` is never
//! re-entered. On completion `next_run_at` is recomputed against the
//! completion time, not the old schedule point, so a long pause does not
//! produce a thundering herd of catch-up runs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use drivemesh_core::domain::{EngineError, EngineResult, SyncTask, TaskId, TaskStatus};
use drivemesh_store::Document;

use crate::cron::CronExpr;

/// Default ticker wake interval.
const TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Executes one sync task to completion.
///
/// Implemented by the sync runner; the scheduler owns task bookkeeping and
/// the dispatcher owns the actual reconciliation.
#[async_trait::async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Runs the task, returning a short human-readable summary on success or
    /// an error message on failure.
    async fn run_task(&self, task: SyncTask) -> Result<String, String>;
}

/// The cron-driven task scheduler.
pub struct Scheduler {
    tasks: Arc<Document<Vec<SyncTask>>>,
    dispatcher: Arc<dyn TaskDispatcher>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(
        tasks: Arc<Document<Vec<SyncTask>>>,
        dispatcher: Arc<dyn TaskDispatcher>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            tasks,
            dispatcher,
            shutdown,
            tracker: TaskTracker::new(),
            tick_interval: TICK_INTERVAL,
        }
    }

    /// Overrides the wake interval (tests).
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Startup reconciliation: tasks stranded in `running` by a crash are
    /// failed, and `next_run_at` is recomputed for every enabled task.
    pub async fn reconcile_on_startup(&self) -> EngineResult<()> {
        let now = Utc::now();
        self.tasks
            .update(|tasks| {
                for task in tasks.iter_mut() {
                    if task.last_status == TaskStatus::Running {
                        task.finish_failure("interrupted by restart");
                    }
                    if task.enabled {
                        task.next_run_at = CronExpr::parse(&task.schedule)
                            .ok()
                            .and_then(|c| c.next_after(now));
                        if task.last_status == TaskStatus::Idle {
                            task.last_status = TaskStatus::Scheduled;
                        }
                    } else {
                        task.next_run_at = None;
                    }
                }
                Ok(())
            })
            .await?;
        info!("Task schedules reconciled");
        Ok(())
    }

    /// Main loop. Returns when the shutdown token fires; in-flight runs are
    /// awaited so a run is never abandoned mid-action.
    pub async fn run(&self) {
        info!(tick_secs = self.tick_interval.as_secs(), "Scheduler starting");

        loop {
            let sleep_for = self.time_until_next_wake().await;
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Scheduler shutting down");
                    break;
                }
                _ = tokio::time::sleep(sleep_for) => {
                    if let Err(err) = self.dispatch_due().await {
                        warn!(error = %err, "Due-task scan failed");
                    }
                }
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        info!("Scheduler stopped");
    }

    /// Sleeps until the earlier of the tick interval and the next scheduled
    /// run.
    async fn time_until_next_wake(&self) -> Duration {
        let next = self
            .tasks
            .read(|tasks| {
                tasks
                    .iter()
                    .filter(|t| t.enabled && t.last_status != TaskStatus::Running)
                    .filter_map(|t| t.next_run_at)
                    .min()
            })
            .await
            .ok()
            .flatten();

        match next {
            Some(at) => {
                let until = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                until.min(self.tick_interval)
            }
            None => self.tick_interval,
        }
    }

    /// Scans for due tasks and dispatches each one.
    async fn dispatch_due(&self) -> EngineResult<()> {
        let now = Utc::now();
        let due: Vec<SyncTask> = self
            .tasks
            .update(|tasks| {
                let mut claimed = Vec::new();
                for task in tasks.iter_mut() {
                    if task.is_due(now) {
                        task.begin_run(now);
                        claimed.push(task.clone());
                    }
                }
                Ok(claimed)
            })
            .await?;

        for task in due {
            debug!(task_id = %task.id, name = %task.name, "Dispatching due task");
            self.spawn_run(task);
        }
        Ok(())
    }

    /// Dispatches one task immediately, bypassing its schedule. Fails with
    /// `Conflict` when the task is already running.
    pub async fn trigger_now(&self, task_id: &TaskId) -> EngineResult<()> {
        let now = Utc::now();
        let id = task_id.clone();
        let task = self
            .tasks
            .update(move |tasks| {
                let task = tasks
                    .iter_mut()
                    .find(|t| t.id == id)
                    .ok_or_else(|| EngineError::NotFound(format!("task {id}")))?;
                if task.last_status == TaskStatus::Running {
                    return Err(EngineError::Conflict(format!(
                        "task {} is already running",
                        task.id
                    )));
                }
                task.begin_run(now);
                Ok(task.clone())
            })
            .await?;

        info!(task_id = %task.id, "Task triggered manually");
        self.spawn_run(task);
        Ok(())
    }

    fn spawn_run(&self, task: SyncTask) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let tasks = Arc::clone(&self.tasks);
        self.tracker.spawn(async move {
            let task_id = task.id.clone();
            let schedule = task.schedule.clone();
            let outcome = dispatcher.run_task(task).await;

            let completed_at = Utc::now();
            let next = CronExpr::parse(&schedule)
                .ok()
                .and_then(|c| c.next_after(completed_at));

            let update = tasks
                .update(move |tasks| {
                    if let Some(task) = tasks.iter_mut().find(|t| t.id == task_id) {
                        match &outcome {
                            Ok(summary) => task.finish_success(summary.clone()),
                            Err(reason) => task.finish_failure(reason.clone()),
                        }
                        task.next_run_at = if task.enabled { next } else { None };
                    }
                    Ok(())
                })
                .await;
            if let Err(err) = update {
                warn!(error = %err, "Failed to record task completion");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingDispatcher {
        runs: AtomicU32,
        delay: Duration,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl TaskDispatcher for CountingDispatcher {
        async fn run_task(&self, _task: SyncTask) -> Result<String, String> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                Err("boom".to_string())
            } else {
                Ok("2 actions".to_string())
            }
        }
    }

    async fn tasks_doc(dir: &std::path::Path) -> Arc<Document<Vec<SyncTask>>> {
        Arc::new(Document::open(dir.join("tasks.json")).await.unwrap())
    }

    fn minutely_task(name: &str) -> SyncTask {
        let mut task = SyncTask::new(
            name,
            drivemesh_core::domain::SyncDirection::Bidirectional,
            drivemesh_core::domain::TenantId::from_string("t1"),
            "fldr",
            std::path::PathBuf::from("/tmp/sync"),
            "* * * * *",
        );
        // Due immediately.
        task.next_run_at = Some(Utc::now() - chrono::Duration::minutes(1));
        task
    }

    #[tokio::test]
    async fn due_task_is_dispatched_once_and_rescheduled() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = tasks_doc(dir.path()).await;
        let task = minutely_task("photos");
        let task_id = task.id.clone();
        tasks
            .update(|t| {
                t.push(task);
                Ok(())
            })
            .await
            .unwrap();

        let dispatcher = Arc::new(CountingDispatcher {
            runs: AtomicU32::new(0),
            delay: Duration::from_millis(50),
            fail: false,
        });
        let shutdown = CancellationToken::new();
        let scheduler = Arc::new(
            Scheduler::new(tasks.clone(), dispatcher.clone(), shutdown.clone())
                .with_tick_interval(Duration::from_millis(20)),
        );

        let handle = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run().await })
        };

        tokio::time::sleep(Duration::from_millis(400)).await;
        shutdown.cancel();
        handle.await.unwrap();

        // Dispatched exactly once: while running it is never re-entered, and
        // after completion next_run_at lands in the future.
        assert_eq!(dispatcher.runs.load(Ordering::SeqCst), 1);

        let task = tasks
            .read(move |t| t.iter().find(|x| x.id == task_id).cloned())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.last_status, TaskStatus::Success);
        assert_eq!(task.last_message.as_deref(), Some("2 actions"));
        assert_eq!(task.consecutive_failures, 0);
        assert!(task.next_run_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn failed_run_increments_failure_counter() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = tasks_doc(dir.path()).await;
        let task = minutely_task("flaky");
        let task_id = task.id.clone();
        tasks
            .update(|t| {
                t.push(task);
                Ok(())
            })
            .await
            .unwrap();

        let dispatcher = Arc::new(CountingDispatcher {
            runs: AtomicU32::new(0),
            delay: Duration::ZERO,
            fail: true,
        });
        let shutdown = CancellationToken::new();
        let scheduler = Scheduler::new(tasks.clone(), dispatcher, shutdown.clone())
            .with_tick_interval(Duration::from_millis(20));

        scheduler.dispatch_due().await.unwrap();
        scheduler.tracker.close();
        scheduler.tracker.wait().await;

        let task = tasks
            .read(move |t| t.iter().find(|x| x.id == task_id).cloned())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.last_status, TaskStatus::Failed);
        assert_eq!(task.last_message.as_deref(), Some("boom"));
        assert_eq!(task.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn disabled_tasks_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = tasks_doc(dir.path()).await;
        let mut task = minutely_task("off");
        task.enabled = false;
        tasks
            .update(|t| {
                t.push(task);
                Ok(())
            })
            .await
            .unwrap();

        let dispatcher = Arc::new(CountingDispatcher {
            runs: AtomicU32::new(0),
            delay: Duration::ZERO,
            fail: false,
        });
        let scheduler = Scheduler::new(tasks, dispatcher.clone(), CancellationToken::new());
        scheduler.dispatch_due().await.unwrap();
        scheduler.tracker.close();
        scheduler.tracker.wait().await;

        assert_eq!(dispatcher.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn trigger_now_rejects_running_task() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = tasks_doc(dir.path()).await;
        let mut task = minutely_task("busy");
        task.begin_run(Utc::now());
        let task_id = task.id.clone();
        tasks
            .update(|t| {
                t.push(task);
                Ok(())
            })
            .await
            .unwrap();

        let dispatcher = Arc::new(CountingDispatcher {
            runs: AtomicU32::new(0),
            delay: Duration::ZERO,
            fail: false,
        });
        let scheduler = Scheduler::new(tasks, dispatcher, CancellationToken::new());

        let err = scheduler.trigger_now(&task_id).await.unwrap_err();
        assert_eq!(err.kind(), "Conflict");
    }

    #[tokio::test]
    async fn startup_reconciliation_fails_stranded_runs_and_recomputes() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = tasks_doc(dir.path()).await;
        let mut stranded = minutely_task("stranded");
        stranded.begin_run(Utc::now());
        stranded.next_run_at = None;
        let stranded_id = stranded.id.clone();

        let mut disabled = minutely_task("off");
        disabled.enabled = false;
        let disabled_id = disabled.id.clone();

        tasks
            .update(|t| {
                t.push(stranded);
                t.push(disabled);
                Ok(())
            })
            .await
            .unwrap();

        let dispatcher = Arc::new(CountingDispatcher {
            runs: AtomicU32::new(0),
            delay: Duration::ZERO,
            fail: false,
        });
        let scheduler = Scheduler::new(tasks.clone(), dispatcher, CancellationToken::new());
        scheduler.reconcile_on_startup().await.unwrap();

        let (stranded, disabled) = tasks
            .read(move |t| {
                (
                    t.iter().find(|x| x.id == stranded_id).cloned().unwrap(),
                    t.iter().find(|x| x.id == disabled_id).cloned().unwrap(),
                )
            })
            .await
            .unwrap();

        assert_eq!(stranded.last_status, TaskStatus::Failed);
        assert_eq!(stranded.last_message.as_deref(), Some("interrupted by restart"));
        assert!(stranded.next_run_at.unwrap() > Utc::now());
        assert!(disabled.next_run_at.is_none());
    }
}
