//! Scheduler background workers.
//!
//! - [`DispatchWorker`] drains the queue, scheduling one task at a time.
//! - [`StatusWorker`] polls machines for tasks the store still has as
//!   `running` and records how they finished.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use super::{ScheduleOutcome, SchedulerResult, TaskScheduler};

/// Places queued tasks, highest priority first.
pub struct DispatchWorker {
    scheduler: Arc<TaskScheduler>,
    interval: Duration,
}

impl DispatchWorker {
    pub fn new(scheduler: Arc<TaskScheduler>, interval: Duration) -> Self {
        Self {
            scheduler,
            interval,
        }
    }

    /// Run the dispatch worker until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting dispatch worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    tokio::select! {
                        result = self.drain() => {
                            if let Err(e) = result {
                                error!(error = %e, "Dispatch pass failed");
                            }
                        }
                        _ = shutdown.changed() => {}
                    }
                    if *shutdown.borrow() {
                        info!("Dispatch worker shutting down");
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Dispatch worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Schedules queued tasks until the queue is empty.
    async fn drain(&self) -> SchedulerResult<usize> {
        let mut placed = 0;
        while let Some((task_id, outcome)) = self.scheduler.dispatch_next().await? {
            match outcome {
                ScheduleOutcome::Placed { .. } => placed += 1,
                // Someone else holds the only task left.
                ScheduleOutcome::AlreadyClaimed => break,
                other => debug!(task_id = %task_id, outcome = ?other, "Task not placed"),
            }
        }
        if placed > 0 {
            info!(placed, "Dispatch pass complete");
        }
        Ok(placed)
    }
}

/// Tracks running tasks to completion.
pub struct StatusWorker {
    scheduler: Arc<TaskScheduler>,
    interval: Duration,
}

impl StatusWorker {
    pub fn new(scheduler: Arc<TaskScheduler>, interval: Duration) -> Self {
        Self {
            scheduler,
            interval,
        }
    }

    /// Run the status worker until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting status worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.refresh().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Status worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn refresh(&self) {
        match self.scheduler.refresh_running().await {
            Ok(stats) if stats.changed() > 0 => info!(
                checked = stats.checked,
                completed = stats.completed,
                failed = stats.failed,
                cancelled = stats.cancelled,
                "Status refresh complete"
            ),
            Ok(_) => {}
            Err(e) => error!(error = %e, "Status refresh failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::{FleetResult, FleetSource};
    use crate::machine::Machine;
    use crate::store::{NewTask, RecordStore, TaskStatus};
    use async_trait::async_trait;
    use cloudagent_reconcile::RetryBudget;

    struct EmptyFleet;

    #[async_trait]
    impl FleetSource for EmptyFleet {
        async fn list(&self) -> FleetResult<Vec<Machine>> {
            Ok(Vec::new())
        }
    }

    fn scheduler() -> Arc<TaskScheduler> {
        Arc::new(TaskScheduler::new(
            Arc::new(RecordStore::in_memory()),
            Arc::new(EmptyFleet),
            Arc::new(crate::prober::HttpMachineApi::new("sk_unused")),
            RetryBudget::default(),
        ))
    }

    #[tokio::test]
    async fn test_drain_empties_queue() {
        let scheduler = scheduler();
        scheduler.enqueue(NewTask::new("a")).await.unwrap();
        scheduler.enqueue(NewTask::new("b")).await.unwrap();

        let worker = DispatchWorker::new(scheduler.clone(), Duration::from_secs(5));
        let placed = worker.drain().await.unwrap();

        // No machines: both tasks fail immediately.
        assert_eq!(placed, 0);
        assert_eq!(scheduler.store().queued_count().await, 0);
        let failed = scheduler
            .store()
            .count_tasks(&crate::store::TaskFilter::status(TaskStatus::Failed))
            .await;
        assert_eq!(failed, 2);
    }

    #[tokio::test]
    async fn test_workers_stop_on_shutdown() {
        let scheduler = scheduler();
        let (tx, rx) = watch::channel(false);

        let dispatch = DispatchWorker::new(scheduler.clone(), Duration::from_millis(10));
        let status = StatusWorker::new(scheduler, Duration::from_millis(10));
        let handle = tokio::spawn(async move {
            tokio::join!(dispatch.run(rx.clone()), status.run(rx));
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
