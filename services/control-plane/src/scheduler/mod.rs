//! Task placement.
//!
//! A task is placed by probing the schedulable fleet in listing order and
//! delegating to the first machine that reports itself available. The
//! probe is only a hint: the machine's atomic accept is what decides, so a
//! rejected delegation simply moves on to the next candidate.
//!
//! Attempts repeat with a fixed delay until the [`RetryBudget`] window runs
//! out, re-fetching the fleet before each retry. Every exit path leaves the
//! task either `running` on exactly one machine or in a terminal state.
//!
//! Background loops live in [`worker`].

mod worker;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use cloudagent_id::TaskId;
use cloudagent_reconcile::RetryBudget;
use cloudagent_wire::{RunOptions, RunTaskRequest, TaskState};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::fleet::{FleetError, FleetSource};
use crate::machine::Machine;
use crate::prober::MachineApi;
use crate::store::{MachineRecord, NewTask, RecordStore, StoreError, TaskRecord, TaskStatus};

pub use worker::{DispatchWorker, StatusWorker};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to list machines: {0}")]
    Fleet(#[from] FleetError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// How a scheduling run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum ScheduleOutcome {
    /// Delegated and marked `running`.
    #[serde(rename_all = "camelCase")]
    Placed {
        machine_id: String,
        machine_name: String,
        attempts: u32,
    },

    /// The fleet had no schedulable machine; the task is `failed`.
    NoMachines,

    /// The budget ran out; the task is `failed`.
    #[serde(rename_all = "camelCase")]
    Exhausted { attempts: u32, elapsed_secs: u64 },

    /// The task was cancelled while being scheduled.
    Cancelled,

    /// Another scheduling loop in this process owns the task.
    AlreadyClaimed,

    /// The task was not `queued` when scheduling began.
    NotQueued { status: TaskStatus },
}

impl ScheduleOutcome {
    pub fn is_placed(&self) -> bool {
        matches!(self, Self::Placed { .. })
    }
}

/// Result of cancelling a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOutcome {
    pub task_id: TaskId,
    pub previous_status: TaskStatus,
    pub current_status: TaskStatus,
}

/// Counters from one pass over running tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshStats {
    pub checked: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl RefreshStats {
    pub fn changed(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }
}

/// Removes the task from the in-process claim set on drop.
struct Claim<'a> {
    claims: &'a Mutex<HashSet<TaskId>>,
    id: TaskId,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.claims
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.id);
    }
}

pub struct TaskScheduler {
    store: Arc<RecordStore>,
    fleet: Arc<dyn FleetSource>,
    machines: Arc<dyn MachineApi>,
    budget: RetryBudget,
    claims: Mutex<HashSet<TaskId>>,
}

impl TaskScheduler {
    pub fn new(
        store: Arc<RecordStore>,
        fleet: Arc<dyn FleetSource>,
        machines: Arc<dyn MachineApi>,
        budget: RetryBudget,
    ) -> Self {
        Self {
            store,
            fleet,
            machines,
            budget,
            claims: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn fleet(&self) -> &Arc<dyn FleetSource> {
        &self.fleet
    }

    fn claim(&self, id: TaskId) -> Option<Claim<'_>> {
        let inserted = self
            .claims
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id);
        if !inserted {
            return None;
        }
        Some(Claim {
            claims: &self.claims,
            id,
        })
    }

    fn claimed(&self) -> HashSet<TaskId> {
        self.claims.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Persists a task as `queued` and schedules it to completion.
    pub async fn submit(&self, new: NewTask) -> SchedulerResult<(TaskRecord, ScheduleOutcome)> {
        let task = self.store.create_task(new).await?;
        info!(task_id = %task.id, priority = %task.priority, "Task submitted");
        let outcome = self.schedule(&task.id).await?;
        let task = self.store.get_task(&task.id).await?;
        Ok((task, outcome))
    }

    /// Persists a task as `queued` for the dispatch worker.
    pub async fn enqueue(&self, new: NewTask) -> SchedulerResult<TaskRecord> {
        let task = self.store.create_task(new).await?;
        info!(task_id = %task.id, priority = %task.priority, "Task enqueued");
        Ok(task)
    }

    /// Schedules the next queued task not already claimed in this process.
    pub async fn dispatch_next(&self) -> SchedulerResult<Option<(TaskId, ScheduleOutcome)>> {
        let Some(task) = self.store.next_in_queue_excluding(&self.claimed()).await else {
            return Ok(None);
        };
        let outcome = self.schedule(&task.id).await?;
        Ok(Some((task.id, outcome)))
    }

    async fn run_request(&self, task: &TaskRecord) -> RunTaskRequest {
        let mut instructions = task.instructions.clone();
        let mut options = task.options.clone();

        if let Some(agent_id) = &task.agent_id {
            match self.store.get_agent(agent_id).await {
                Ok(agent) => {
                    if let Some(prompt) = agent.system_prompt.filter(|p| !p.trim().is_empty()) {
                        instructions = format!("{prompt}\n\n{instructions}");
                    }
                    if let (None, Some(max_turns)) = (&options, agent.max_turns) {
                        options = Some(RunOptions {
                            max_turns,
                            ..RunOptions::default()
                        });
                    }
                }
                Err(e) => warn!(task_id = %task.id, error = %e, "Agent lookup failed, running without it"),
            }
        }

        RunTaskRequest {
            task_id: task.id.to_string(),
            instructions,
            options,
        }
    }

    async fn fail(&self, id: &TaskId, message: String) -> SchedulerResult<()> {
        match self.store.mark_as_failed(id, message).await {
            Ok(_) => Ok(()),
            // Cancelled under us; the cancel wins.
            Err(StoreError::InvalidTransition { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn still_queued(&self, id: &TaskId) -> SchedulerResult<bool> {
        Ok(self.store.get_task(id).await?.status == TaskStatus::Queued)
    }

    /// Runs the placement loop for one queued task.
    pub async fn schedule(&self, id: &TaskId) -> SchedulerResult<ScheduleOutcome> {
        let Some(_claim) = self.claim(*id) else {
            return Ok(ScheduleOutcome::AlreadyClaimed);
        };

        let task = self.store.get_task(id).await?;
        if task.status != TaskStatus::Queued {
            return Ok(ScheduleOutcome::NotQueued {
                status: task.status,
            });
        }
        let request = self.run_request(&task).await;
        let started = Instant::now();

        let mut candidates = match self.fleet.candidates().await {
            Ok(c) => c,
            Err(e) => {
                self.fail(id, format!("Failed to list machines: {e}")).await?;
                return Err(e.into());
            }
        };
        if candidates.is_empty() {
            warn!(task_id = %id, "No available machines");
            self.fail(id, "No available machines".to_string()).await?;
            return Ok(ScheduleOutcome::NoMachines);
        }

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            debug!(task_id = %id, attempt = attempts, candidates = candidates.len(), "Scheduling attempt");

            for machine in &candidates {
                if let Some(outcome) = self.try_place(id, &request, machine, attempts).await? {
                    return Ok(outcome);
                }
            }

            let Some(delay) = self.budget.next_delay(started.elapsed()) else {
                break;
            };
            debug!(task_id = %id, delay_secs = delay.as_secs(), "No machine accepted the task, retrying");
            tokio::time::sleep(delay).await;

            if !self.still_queued(id).await? {
                info!(task_id = %id, "Task left the queue while scheduling");
                return Ok(ScheduleOutcome::Cancelled);
            }

            candidates = match self.fleet.candidates().await {
                Ok(c) => c,
                Err(e) => {
                    warn!(task_id = %id, error = %e, "Failed to refresh machines");
                    Vec::new()
                }
            };
            if candidates.is_empty() {
                warn!(task_id = %id, attempt = attempts, "No available machines on retry");
            }
        }

        let elapsed_secs = started.elapsed().as_secs();
        warn!(task_id = %id, attempts, elapsed_secs, "Scheduling budget exhausted");
        self.fail(
            id,
            format!(
                "Task scheduling failed after {attempts} attempts over {elapsed_secs}s; \
                 all machines remained busy or unavailable"
            ),
        )
        .await?;
        Ok(ScheduleOutcome::Exhausted {
            attempts,
            elapsed_secs,
        })
    }

    /// Probes and delegates to one machine. `None` means try the next one.
    async fn try_place(
        &self,
        id: &TaskId,
        request: &RunTaskRequest,
        machine: &Machine,
        attempts: u32,
    ) -> SchedulerResult<Option<ScheduleOutcome>> {
        let Some(address) = machine.address.as_deref() else {
            return Ok(None);
        };
        if !self.machines.is_available(address).await {
            debug!(task_id = %id, machine = %machine.name, "Machine unavailable");
            return Ok(None);
        }

        if let Err(e) = self.machines.delegate(address, request).await {
            warn!(task_id = %id, machine = %machine.name, error = %e, "Delegation failed");
            return Ok(None);
        }

        // The machine owns the task now; a placement the store did not
        // record must not keep running.
        if let Err(store_err) = self.store.mark_as_running(id, &machine.id).await {
            if let Err(e) = self.machines.cancel(address, &request.task_id).await {
                warn!(task_id = %id, machine = %machine.name, error = %e, "Remote cancel failed");
            }
            return match store_err {
                StoreError::InvalidTransition { .. } => {
                    info!(task_id = %id, machine = %machine.name, "Task cancelled during delegation");
                    Ok(Some(ScheduleOutcome::Cancelled))
                }
                e => {
                    error!(task_id = %id, machine = %machine.name, error = %e, "Failed to record placement");
                    Err(e.into())
                }
            };
        }

        if let Err(e) = self.store.upsert_machine(MachineRecord::from_machine(machine)).await {
            warn!(machine = %machine.name, error = %e, "Failed to record machine");
        }
        info!(task_id = %id, machine = %machine.name, attempts, "Task placed");
        Ok(Some(ScheduleOutcome::Placed {
            machine_id: machine.id.clone(),
            machine_name: machine.name.clone(),
            attempts,
        }))
    }

    async fn machine_address(&self, machine_id: &str) -> Option<String> {
        match self.store.get_machine(machine_id).await {
            Ok(record) => record.address,
            Err(_) => None,
        }
    }

    /// Cancels a task, and the remote execution if it was running.
    pub async fn cancel(&self, id: &TaskId) -> SchedulerResult<CancelOutcome> {
        let (previous, task) = self.store.cancel_task(id).await?;

        if previous == TaskStatus::Running {
            if let Some(machine_id) = &task.machine_id {
                match self.machine_address(machine_id).await {
                    Some(address) => {
                        if let Err(e) = self.machines.cancel(&address, &id.to_string()).await {
                            warn!(task_id = %id, machine_id = %machine_id, error = %e, "Remote cancel failed");
                        }
                    }
                    None => warn!(task_id = %id, machine_id = %machine_id, "No address for remote cancel"),
                }
            }
        }

        if previous != task.status {
            info!(task_id = %id, previous = %previous, "Task cancelled");
        }
        Ok(CancelOutcome {
            task_id: *id,
            previous_status: previous,
            current_status: task.status,
        })
    }

    /// Folds the machines' view of running tasks back into the store.
    pub async fn refresh_running(&self) -> SchedulerResult<RefreshStats> {
        let mut stats = RefreshStats::default();
        let running = self
            .store
            .list_tasks(&crate::store::TaskFilter::status(TaskStatus::Running))
            .await;
        if running.is_empty() {
            return Ok(stats);
        }

        let fleet = self.fleet.list().await?;

        for task in running {
            stats.checked += 1;
            let address = task
                .machine_id
                .as_deref()
                .and_then(|mid| fleet.iter().find(|m| m.id == mid))
                .and_then(|m| m.address.clone());

            let Some(address) = address else {
                self.record_failure(&task.id, "Assigned machine is no longer in the fleet", &mut stats)
                    .await?;
                continue;
            };

            let remote = match self.machines.task_status(&address, &task.id.to_string()).await {
                Ok(remote) => remote,
                Err(e) => {
                    debug!(task_id = %task.id, error = %e, "Status poll failed");
                    continue;
                }
            };

            let Some(remote) = remote else {
                self.record_failure(&task.id, "Machine has no record of the task", &mut stats)
                    .await?;
                continue;
            };

            let result = match remote.status {
                TaskState::Running => continue,
                TaskState::Completed => self
                    .store
                    .mark_as_completed(&task.id, None)
                    .await
                    .map(|_| stats.completed += 1),
                TaskState::Failed => {
                    let error = remote
                        .error
                        .unwrap_or_else(|| "Task failed on machine".to_string());
                    self.store
                        .mark_as_failed(&task.id, error)
                        .await
                        .map(|_| stats.failed += 1)
                }
                TaskState::Cancelled => self
                    .store
                    .cancel_task(&task.id)
                    .await
                    .map(|_| stats.cancelled += 1),
            };
            match result {
                Ok(()) => info!(task_id = %task.id, status = %remote.status, "Task finished on machine"),
                // Changed by someone else since the listing.
                Err(StoreError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(stats)
    }

    async fn record_failure(
        &self,
        id: &TaskId,
        message: &str,
        stats: &mut RefreshStats,
    ) -> SchedulerResult<()> {
        warn!(task_id = %id, reason = message, "Marking running task failed");
        match self.store.mark_as_failed(id, message).await {
            Ok(_) => stats.failed += 1,
            Err(StoreError::InvalidTransition { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use cloudagent_wire::TaskStatusRecord;

    use super::*;
    use crate::fleet::FleetResult;
    use crate::machine::{MachineHealth, MachineStatus, ProviderKind};
    use crate::prober::DelegationError;

    fn machine(id: &str, address: &str) -> Machine {
        Machine {
            id: id.to_string(),
            name: format!("m{id}"),
            provider: ProviderKind::Hetzner,
            region: "fsn1".to_string(),
            instance_type: "cpx11".to_string(),
            address: Some(address.to_string()),
            status: MachineStatus::Running,
            health: MachineHealth::Healthy,
            created_at: None,
            tags: BTreeMap::new(),
        }
    }

    struct StaticFleet {
        machines: Vec<Machine>,
        lists: AtomicUsize,
    }

    impl StaticFleet {
        fn new(machines: Vec<Machine>) -> Arc<Self> {
            Arc::new(Self {
                machines,
                lists: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl FleetSource for StaticFleet {
        async fn list(&self) -> FleetResult<Vec<Machine>> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            Ok(self.machines.clone())
        }
    }

    /// One-slot machines keyed by address. Delegation is an atomic accept.
    #[derive(Default)]
    struct FakeMachines {
        busy: Mutex<HashSet<String>>,
        probes: AtomicUsize,
        reject: Mutex<HashSet<String>>,
        remote: Mutex<Option<TaskStatusRecord>>,
        cancels: AtomicUsize,
        always_busy: AtomicBool,
    }

    impl FakeMachines {
        fn busy(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
            self.busy.lock().unwrap()
        }
    }

    #[async_trait]
    impl MachineApi for FakeMachines {
        async fn health(&self, _address: &str) -> MachineHealth {
            MachineHealth::Healthy
        }

        async fn is_available(&self, address: &str) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            !self.always_busy.load(Ordering::SeqCst) && !self.busy().contains(address)
        }

        async fn delegate(
            &self,
            address: &str,
            _request: &RunTaskRequest,
        ) -> Result<(), DelegationError> {
            // Let a concurrent scheduler run between probe and accept.
            tokio::task::yield_now().await;
            if self.reject.lock().unwrap().contains(address) {
                return Err(DelegationError::Rejected {
                    status: 500,
                    body: "engine missing".to_string(),
                });
            }
            if !self.busy().insert(address.to_string()) {
                return Err(DelegationError::Busy);
            }
            Ok(())
        }

        async fn task_status(
            &self,
            _address: &str,
            _task_id: &str,
        ) -> Result<Option<TaskStatusRecord>, DelegationError> {
            Ok(self.remote.lock().unwrap().clone())
        }

        async fn cancel(&self, _address: &str, _task_id: &str) -> Result<(), DelegationError> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn scheduler(
        fleet: Arc<StaticFleet>,
        machines: Arc<FakeMachines>,
        budget: RetryBudget,
    ) -> TaskScheduler {
        TaskScheduler::new(Arc::new(RecordStore::in_memory()), fleet, machines, budget)
    }

    #[tokio::test]
    async fn test_no_candidates_fails_without_probing() {
        let machines = Arc::new(FakeMachines::default());
        let mut unhealthy = machine("1", "10.0.0.1");
        unhealthy.health = MachineHealth::Unhealthy;
        let s = scheduler(StaticFleet::new(vec![unhealthy]), machines.clone(), RetryBudget::default());

        let (task, outcome) = s.submit(NewTask::new("x")).await.unwrap();

        assert_eq!(outcome, ScheduleOutcome::NoMachines);
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("No available machines"));
        assert!(task.machine_id.is_none());
        assert_eq!(machines.probes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_delegation_failure_moves_to_next_candidate() {
        let machines = Arc::new(FakeMachines::default());
        machines.reject.lock().unwrap().insert("10.0.0.1".to_string());
        let fleet = StaticFleet::new(vec![machine("1", "10.0.0.1"), machine("2", "10.0.0.2")]);
        let s = scheduler(fleet, machines.clone(), RetryBudget::default());

        let (task, outcome) = s.submit(NewTask::new("x")).await.unwrap();

        assert_eq!(
            outcome,
            ScheduleOutcome::Placed {
                machine_id: "2".to_string(),
                machine_name: "m2".to_string(),
                attempts: 1
            }
        );
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.machine_id.as_deref(), Some("2"));
        assert_eq!(s.store().list_machines().await[0].id, "2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_within_budget() {
        let machines = Arc::new(FakeMachines::default());
        machines.always_busy.store(true, Ordering::SeqCst);
        let fleet = StaticFleet::new(vec![machine("1", "10.0.0.1")]);
        let budget = RetryBudget::default();
        let s = scheduler(fleet.clone(), machines.clone(), budget);

        let started = Instant::now();
        let (task, outcome) = s.submit(NewTask::new("x")).await.unwrap();
        let elapsed = started.elapsed();

        let ScheduleOutcome::Exhausted { attempts, .. } = outcome else {
            panic!("expected exhaustion, got {outcome:?}");
        };
        assert_eq!(attempts, budget.max_attempts());
        assert!(elapsed <= budget.window + budget.delay);
        assert!(elapsed >= budget.window - budget.delay);
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains(&format!("after {attempts} attempts")));
        // One fetch per attempt.
        assert_eq!(fleet.lists.load(Ordering::SeqCst), attempts as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_submissions_place_one() {
        let machines = Arc::new(FakeMachines::default());
        let fleet = StaticFleet::new(vec![machine("1", "10.0.0.1")]);
        let budget = RetryBudget::new(Duration::from_secs(20), Duration::from_secs(5));
        let s = scheduler(fleet, machines.clone(), budget);

        let (a, b) = tokio::join!(s.submit(NewTask::new("a")), s.submit(NewTask::new("b")));
        let (a, b) = (a.unwrap(), b.unwrap());

        let placed = [&a, &b].iter().filter(|r| r.1.is_placed()).count();
        assert_eq!(placed, 1);
        let mut statuses = vec![a.0.status, b.0.status];
        statuses.sort_by_key(|s| s.as_str());
        assert_eq!(statuses, vec![TaskStatus::Failed, TaskStatus::Running]);
    }

    #[tokio::test]
    async fn test_cancelled_task_is_not_scheduled() {
        let machines = Arc::new(FakeMachines::default());
        let s = scheduler(
            StaticFleet::new(vec![machine("1", "10.0.0.1")]),
            machines.clone(),
            RetryBudget::default(),
        );
        let task = s.enqueue(NewTask::new("x")).await.unwrap();
        s.cancel(&task.id).await.unwrap();

        let outcome = s.schedule(&task.id).await.unwrap();

        assert_eq!(
            outcome,
            ScheduleOutcome::NotQueued {
                status: TaskStatus::Cancelled
            }
        );
        assert_eq!(machines.probes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dispatch_next_takes_highest_priority() {
        let machines = Arc::new(FakeMachines::default());
        let s = scheduler(
            StaticFleet::new(vec![machine("1", "10.0.0.1")]),
            machines,
            RetryBudget::default(),
        );
        s.enqueue(NewTask::new("low").with_priority(crate::store::Priority::Low))
            .await
            .unwrap();
        let urgent = s
            .enqueue(NewTask::new("urgent").with_priority(crate::store::Priority::Urgent))
            .await
            .unwrap();

        let (id, outcome) = s.dispatch_next().await.unwrap().unwrap();

        assert_eq!(id, urgent.id);
        assert!(outcome.is_placed());
    }

    #[tokio::test]
    async fn test_cancel_running_task_cancels_remotely() {
        let machines = Arc::new(FakeMachines::default());
        let s = scheduler(
            StaticFleet::new(vec![machine("1", "10.0.0.1")]),
            machines.clone(),
            RetryBudget::default(),
        );
        let (task, _) = s.submit(NewTask::new("x")).await.unwrap();

        let outcome = s.cancel(&task.id).await.unwrap();

        assert_eq!(outcome.previous_status, TaskStatus::Running);
        assert_eq!(outcome.current_status, TaskStatus::Cancelled);
        assert_eq!(machines.cancels.load(Ordering::SeqCst), 1);

        // Idempotent.
        let again = s.cancel(&task.id).await.unwrap();
        assert_eq!(again.previous_status, TaskStatus::Cancelled);
        assert_eq!(machines.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_folds_remote_state() {
        let machines = Arc::new(FakeMachines::default());
        let s = scheduler(
            StaticFleet::new(vec![machine("1", "10.0.0.1")]),
            machines.clone(),
            RetryBudget::default(),
        );
        let (task, _) = s.submit(NewTask::new("x")).await.unwrap();

        *machines.remote.lock().unwrap() = Some(TaskStatusRecord::running(task.id.to_string()));
        let stats = s.refresh_running().await.unwrap();
        assert_eq!(stats.checked, 1);
        assert_eq!(stats.changed(), 0);

        let mut done = TaskStatusRecord::running(task.id.to_string());
        done.finish(TaskState::Failed, Some("Task timed out after 60s".to_string()));
        *machines.remote.lock().unwrap() = Some(done);
        let stats = s.refresh_running().await.unwrap();
        assert_eq!(stats.failed, 1);

        let task = s.store().get_task(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("Task timed out after 60s"));
    }

    #[tokio::test]
    async fn test_refresh_fails_tasks_on_vanished_machines() {
        let machines = Arc::new(FakeMachines::default());
        let store = Arc::new(RecordStore::in_memory());
        let task = store.create_task(NewTask::new("x")).await.unwrap();
        store.mark_as_running(&task.id, "gone").await.unwrap();
        let s = TaskScheduler::new(
            store.clone(),
            StaticFleet::new(vec![machine("1", "10.0.0.1")]),
            machines,
            RetryBudget::default(),
        );

        let stats = s.refresh_running().await.unwrap();

        assert_eq!(stats.failed, 1);
        assert_eq!(store.get_task(&task.id).await.unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_unrecorded_placement_is_cancelled_remotely() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        let store = Arc::new(RecordStore::open(&path).unwrap());
        let machines = Arc::new(FakeMachines::default());
        let s = TaskScheduler::new(
            store.clone(),
            StaticFleet::new(vec![machine("1", "10.0.0.1")]),
            machines.clone(),
            RetryBudget::default(),
        );
        let task = s.enqueue(NewTask::new("x")).await.unwrap();

        // A directory where the temp snapshot goes makes every write fail.
        std::fs::create_dir(path.with_extension("json.tmp")).unwrap();
        let err = s.schedule(&task.id).await.unwrap_err();

        assert!(matches!(err, SchedulerError::Store(StoreError::Io { .. })));
        assert_eq!(machines.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(store.get_task(&task.id).await.unwrap().status, TaskStatus::Queued);
    }
}
