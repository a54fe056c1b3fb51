//! Record store for machines, agents and tasks.
//!
//! The whole record set lives in one JSON snapshot. Every mutation is
//! applied to a copy, written to a `.tmp` sibling and renamed into place,
//! and only then becomes visible to readers. A failed write leaves both the
//! file and the in-memory view untouched.
//!
//! All read-modify-write sequences serialize on one async mutex; this
//! process is the only writer of the snapshot file.

mod records;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use cloudagent_id::{AgentId, TaskId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub use records::{
    AgentRecord, MachineRecord, NewAgent, NewTask, Priority, TaskFilter, TaskRecord, TaskStatus,
    DEFAULT_MAX_RETRIES,
};

use crate::machine::MachineStatus;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{0}")]
    Conflict(String),

    #[error("task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt record store {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

fn task_not_found(id: &TaskId) -> StoreError {
    StoreError::NotFound {
        kind: "task",
        id: id.to_string(),
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError {
    let path = path.to_path_buf();
    move |source| StoreError::Io { path, source }
}

/// On-disk snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub machines: Vec<MachineRecord>,
    #[serde(default)]
    pub agents: Vec<AgentRecord>,
    #[serde(default)]
    pub tasks: Vec<TaskRecord>,
}

impl Snapshot {
    fn task_mut(&mut self, id: &TaskId) -> StoreResult<&mut TaskRecord> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == *id)
            .ok_or_else(|| task_not_found(id))
    }

    fn machine_mut(&mut self, id: &str) -> StoreResult<&mut MachineRecord> {
        self.machines
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "machine",
                id: id.to_string(),
            })
    }

    fn transition(
        &mut self,
        id: &TaskId,
        to: TaskStatus,
        apply: impl FnOnce(&mut TaskRecord),
    ) -> StoreResult<TaskRecord> {
        let task = self.task_mut(id)?;
        if !task.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                id: *id,
                from: task.status,
                to,
            });
        }
        let now = Utc::now();
        task.status = to;
        task.updated_at = now;
        if to.is_terminal() {
            task.completed_at = Some(now);
        }
        apply(task);
        Ok(task.clone())
    }

    fn queued<'a>(&'a self, skip: &'a HashSet<TaskId>) -> impl Iterator<Item = &'a TaskRecord> {
        self.tasks
            .iter()
            .filter(move |t| t.status == TaskStatus::Queued && !skip.contains(&t.id))
    }
}

/// Snapshot-persisted record store.
#[derive(Debug)]
pub struct RecordStore {
    path: Option<PathBuf>,
    snapshot: Mutex<Snapshot>,
}

impl RecordStore {
    /// Loads the snapshot at `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let snapshot = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No record store file, starting empty");
                Snapshot::default()
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        let store = Self {
            path: Some(path),
            snapshot: Mutex::new(snapshot),
        };
        Ok(store)
    }

    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            snapshot: Mutex::new(Snapshot::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn persist(&self, snapshot: &Snapshot) -> StoreResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let content = serde_json::to_vec_pretty(snapshot).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(io_err(&tmp))?;
        fs::rename(&tmp, path).map_err(io_err(path))?;
        Ok(())
    }

    /// Runs `f` against a copy and commits it only if persisting succeeds.
    async fn mutate<T>(&self, f: impl FnOnce(&mut Snapshot) -> StoreResult<T>) -> StoreResult<T> {
        let mut guard = self.snapshot.lock().await;
        let mut next = guard.clone();
        let out = f(&mut next)?;
        self.persist(&next)?;
        *guard = next;
        Ok(out)
    }

    async fn read<T>(&self, f: impl FnOnce(&Snapshot) -> T) -> T {
        let guard = self.snapshot.lock().await;
        f(&guard)
    }

    // Machines

    pub async fn create_machine(&self, record: MachineRecord) -> StoreResult<MachineRecord> {
        self.mutate(|s| {
            if s.machines.iter().any(|m| m.name == record.name) {
                return Err(StoreError::Conflict(format!(
                    "machine name already exists: {}",
                    record.name
                )));
            }
            if s.machines.iter().any(|m| m.id == record.id) {
                return Err(StoreError::Conflict(format!(
                    "machine id already exists: {}",
                    record.id
                )));
            }
            s.machines.push(record.clone());
            Ok(record)
        })
        .await
    }

    pub async fn get_machine(&self, id: &str) -> StoreResult<MachineRecord> {
        self.read(|s| s.machines.iter().find(|m| m.id == id).cloned())
            .await
            .ok_or_else(|| StoreError::NotFound {
                kind: "machine",
                id: id.to_string(),
            })
    }

    pub async fn list_machines(&self) -> Vec<MachineRecord> {
        self.read(|s| s.machines.clone()).await
    }

    pub async fn update_machine(
        &self,
        id: &str,
        apply: impl FnOnce(&mut MachineRecord),
    ) -> StoreResult<MachineRecord> {
        self.mutate(|s| {
            let machine = s.machine_mut(id)?;
            apply(machine);
            machine.updated_at = Utc::now();
            Ok(machine.clone())
        })
        .await
    }

    /// Inserts or refreshes a machine by provider id.
    ///
    /// A record with the same name but a different id is a machine that was
    /// replaced under that name, and is dropped.
    pub async fn upsert_machine(&self, record: MachineRecord) -> StoreResult<MachineRecord> {
        self.mutate(|s| {
            s.machines.retain(|m| m.id == record.id || m.name != record.name);
            match s.machines.iter_mut().find(|m| m.id == record.id) {
                Some(existing) => {
                    let created_at = existing.created_at;
                    *existing = MachineRecord {
                        created_at,
                        ..record
                    };
                    Ok(existing.clone())
                }
                None => {
                    s.machines.push(record.clone());
                    Ok(record)
                }
            }
        })
        .await
    }

    pub async fn delete_machine(&self, id: &str) -> StoreResult<()> {
        self.mutate(|s| {
            let before = s.machines.len();
            s.machines.retain(|m| m.id != id);
            if s.machines.len() == before {
                return Err(StoreError::NotFound {
                    kind: "machine",
                    id: id.to_string(),
                });
            }
            Ok(())
        })
        .await
    }

    /// Running machines with no running task bound to them.
    pub async fn find_available_machines(&self) -> Vec<MachineRecord> {
        self.read(|s| {
            let busy: HashSet<&str> = s
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Running)
                .filter_map(|t| t.machine_id.as_deref())
                .collect();
            s.machines
                .iter()
                .filter(|m| m.status == MachineStatus::Running && !busy.contains(m.id.as_str()))
                .cloned()
                .collect()
        })
        .await
    }

    // Agents

    pub async fn create_agent(&self, new: NewAgent) -> StoreResult<AgentRecord> {
        let name = new.name.trim().to_string();
        if name.is_empty() {
            return Err(StoreError::Conflict("agent name must not be empty".to_string()));
        }
        self.mutate(|s| {
            if s.agents.iter().any(|a| a.name == name) {
                return Err(StoreError::Conflict(format!(
                    "agent name already exists: {name}"
                )));
            }
            let agent = AgentRecord {
                id: AgentId::new(),
                name,
                system_prompt: new.system_prompt,
                max_turns: new.max_turns,
                created_at: Utc::now(),
            };
            s.agents.push(agent.clone());
            Ok(agent)
        })
        .await
    }

    pub async fn get_agent(&self, id: &AgentId) -> StoreResult<AgentRecord> {
        self.read(|s| s.agents.iter().find(|a| a.id == *id).cloned())
            .await
            .ok_or_else(|| StoreError::NotFound {
                kind: "agent",
                id: id.to_string(),
            })
    }

    pub async fn find_agent_by_name(&self, name: &str) -> Option<AgentRecord> {
        self.read(|s| s.agents.iter().find(|a| a.name == name).cloned())
            .await
    }

    pub async fn list_agents(&self) -> Vec<AgentRecord> {
        self.read(|s| s.agents.clone()).await
    }

    pub async fn delete_agent(&self, id: &AgentId) -> StoreResult<()> {
        self.mutate(|s| {
            let before = s.agents.len();
            s.agents.retain(|a| a.id != *id);
            if s.agents.len() == before {
                return Err(StoreError::NotFound {
                    kind: "agent",
                    id: id.to_string(),
                });
            }
            Ok(())
        })
        .await
    }

    // Tasks

    pub async fn create_task(&self, new: NewTask) -> StoreResult<TaskRecord> {
        self.mutate(|s| {
            if let Some(agent_id) = &new.agent_id {
                if !s.agents.iter().any(|a| a.id == *agent_id) {
                    return Err(StoreError::NotFound {
                        kind: "agent",
                        id: agent_id.to_string(),
                    });
                }
            }
            let now = Utc::now();
            let task = TaskRecord {
                id: TaskId::new(),
                agent_id: new.agent_id,
                machine_id: None,
                instructions: new.instructions,
                options: new.options,
                status: TaskStatus::Queued,
                priority: new.priority,
                created_at: now,
                updated_at: now,
                started_at: None,
                completed_at: None,
                result: None,
                error: None,
                retry_count: 0,
                max_retries: new.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            };
            s.tasks.push(task.clone());
            Ok(task)
        })
        .await
    }

    pub async fn get_task(&self, id: &TaskId) -> StoreResult<TaskRecord> {
        self.read(|s| s.tasks.iter().find(|t| t.id == *id).cloned())
            .await
            .ok_or_else(|| task_not_found(id))
    }

    /// Matching tasks in queue order, paged by `limit`/`offset`.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Vec<TaskRecord> {
        self.read(|s| {
            let mut tasks: Vec<TaskRecord> =
                s.tasks.iter().filter(|t| filter.matches(t)).cloned().collect();
            tasks.sort_by(TaskRecord::queue_order);
            tasks
                .into_iter()
                .skip(filter.offset)
                .take(filter.limit.unwrap_or(usize::MAX))
                .collect()
        })
        .await
    }

    /// Matching tasks, ignoring paging.
    pub async fn count_tasks(&self, filter: &TaskFilter) -> usize {
        self.read(|s| s.tasks.iter().filter(|t| filter.matches(t)).count())
            .await
    }

    pub async fn delete_task(&self, id: &TaskId) -> StoreResult<()> {
        self.mutate(|s| {
            let before = s.tasks.len();
            s.tasks.retain(|t| t.id != *id);
            if s.tasks.len() == before {
                return Err(task_not_found(id));
            }
            Ok(())
        })
        .await
    }

    /// Highest priority, oldest queued task.
    pub async fn next_in_queue(&self) -> Option<TaskRecord> {
        self.next_in_queue_excluding(&HashSet::new()).await
    }

    /// Like [`Self::next_in_queue`], skipping the given ids.
    pub async fn next_in_queue_excluding(&self, skip: &HashSet<TaskId>) -> Option<TaskRecord> {
        self.read(|s| s.queued(skip).min_by(|a, b| a.queue_order(b)).cloned())
            .await
    }

    pub async fn queued_count(&self) -> usize {
        self.count_tasks(&TaskFilter::status(TaskStatus::Queued)).await
    }

    pub async fn running_count(&self) -> usize {
        self.count_tasks(&TaskFilter::status(TaskStatus::Running)).await
    }

    /// `queued → running`, binding the machine and start time.
    pub async fn mark_as_running(&self, id: &TaskId, machine_id: &str) -> StoreResult<TaskRecord> {
        let task = self
            .mutate(|s| {
                s.transition(id, TaskStatus::Running, |t| {
                    t.machine_id.get_or_insert_with(|| machine_id.to_string());
                    t.started_at = Some(t.updated_at);
                })
            })
            .await?;
        info!(task_id = %id, machine_id, "Task running");
        Ok(task)
    }

    pub async fn mark_as_completed(
        &self,
        id: &TaskId,
        result: Option<serde_json::Value>,
    ) -> StoreResult<TaskRecord> {
        self.mutate(|s| {
            s.transition(id, TaskStatus::Completed, |t| {
                t.result = result;
                t.error = None;
            })
        })
        .await
    }

    /// `queued|running → failed`, recording the error and counting a retry.
    pub async fn mark_as_failed(
        &self,
        id: &TaskId,
        error: impl Into<String>,
    ) -> StoreResult<TaskRecord> {
        let error = error.into();
        self.mutate(|s| {
            s.transition(id, TaskStatus::Failed, |t| {
                t.error = Some(error);
                t.retry_count += 1;
            })
        })
        .await
    }

    /// Cancels a non-terminal task. Cancelling a cancelled task is a no-op.
    ///
    /// Returns the status the task had before the call.
    pub async fn cancel_task(&self, id: &TaskId) -> StoreResult<(TaskStatus, TaskRecord)> {
        self.mutate(|s| {
            let previous = s.task_mut(id)?.status;
            if previous == TaskStatus::Cancelled {
                return Ok((previous, s.task_mut(id)?.clone()));
            }
            let task = s.transition(id, TaskStatus::Cancelled, |t| {
                t.error = Some("Task cancelled".to_string());
            })?;
            Ok((previous, task))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::ProviderKind;

    fn machine(id: &str, name: &str) -> MachineRecord {
        let now = Utc::now();
        MachineRecord {
            id: id.to_string(),
            name: name.to_string(),
            provider: ProviderKind::Hetzner,
            region: "fsn1".to_string(),
            instance_type: "cpx11".to_string(),
            address: Some("10.0.0.1".to_string()),
            status: MachineStatus::Running,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_next_in_queue_priority_then_fifo() {
        let store = RecordStore::in_memory();
        let low = store.create_task(NewTask::new("low").with_priority(Priority::Low)).await.unwrap();
        let normal_a = store.create_task(NewTask::new("a")).await.unwrap();
        let urgent = store
            .create_task(NewTask::new("urgent").with_priority(Priority::Urgent))
            .await
            .unwrap();
        let normal_b = store.create_task(NewTask::new("b")).await.unwrap();

        let order: Vec<TaskId> = store
            .list_tasks(&TaskFilter::default())
            .await
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(order, vec![urgent.id, normal_a.id, normal_b.id, low.id]);

        assert_eq!(store.next_in_queue().await.unwrap().id, urgent.id);
        store.mark_as_running(&urgent.id, "m1").await.unwrap();
        assert_eq!(store.next_in_queue().await.unwrap().id, normal_a.id);

        let skip = HashSet::from([normal_a.id]);
        assert_eq!(store.next_in_queue_excluding(&skip).await.unwrap().id, normal_b.id);
    }

    #[tokio::test]
    async fn test_transitions_enforced() {
        let store = RecordStore::in_memory();
        let task = store.create_task(NewTask::new("x")).await.unwrap();

        let err = store.mark_as_completed(&task.id, None).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { from: TaskStatus::Queued, .. }));

        let running = store.mark_as_running(&task.id, "m1").await.unwrap();
        assert_eq!(running.machine_id.as_deref(), Some("m1"));
        assert!(running.started_at.is_some());

        let err = store.mark_as_running(&task.id, "m2").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let failed = store.mark_as_failed(&task.id, "boom").await.unwrap();
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.machine_id.as_deref(), Some("m1"));
        assert!(failed.completed_at.is_some());

        let err = store.cancel_task(&task.id).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { to: TaskStatus::Cancelled, .. }));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let store = RecordStore::in_memory();
        let task = store.create_task(NewTask::new("x")).await.unwrap();

        let (previous, cancelled) = store.cancel_task(&task.id).await.unwrap();
        assert_eq!(previous, TaskStatus::Queued);
        assert_eq!(cancelled.status, TaskStatus::Cancelled);

        let (previous, again) = store.cancel_task(&task.id).await.unwrap();
        assert_eq!(previous, TaskStatus::Cancelled);
        assert_eq!(again, cancelled);
    }

    #[tokio::test]
    async fn test_counts_and_filters() {
        let store = RecordStore::in_memory();
        for i in 0..3 {
            store.create_task(NewTask::new(format!("t{i}"))).await.unwrap();
        }
        let first = store.next_in_queue().await.unwrap();
        store.mark_as_running(&first.id, "m1").await.unwrap();

        assert_eq!(store.queued_count().await, 2);
        assert_eq!(store.running_count().await, 1);

        let page = TaskFilter {
            limit: Some(1),
            offset: 1,
            ..TaskFilter::default()
        };
        assert_eq!(store.list_tasks(&page).await.len(), 1);
        assert_eq!(store.count_tasks(&page).await, 3);

        let on_m1 = TaskFilter {
            machine_id: Some("m1".to_string()),
            ..TaskFilter::default()
        };
        assert_eq!(store.list_tasks(&on_m1).await[0].id, first.id);
    }

    #[tokio::test]
    async fn test_unique_names() {
        let store = RecordStore::in_memory();
        store.create_machine(machine("1", "a")).await.unwrap();
        let err = store.create_machine(machine("2", "a")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        store
            .create_agent(NewAgent {
                name: "coder".to_string(),
                ..NewAgent::default()
            })
            .await
            .unwrap();
        let err = store
            .create_agent(NewAgent {
                name: "coder".to_string(),
                ..NewAgent::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert!(store.find_agent_by_name("coder").await.is_some());
    }

    #[tokio::test]
    async fn test_find_available_skips_busy_machines() {
        let store = RecordStore::in_memory();
        store.create_machine(machine("1", "a")).await.unwrap();
        store.create_machine(machine("2", "b")).await.unwrap();
        let mut stopped = machine("3", "c");
        stopped.status = MachineStatus::Stopped;
        store.create_machine(stopped).await.unwrap();

        let task = store.create_task(NewTask::new("x")).await.unwrap();
        store.mark_as_running(&task.id, "1").await.unwrap();

        let available: Vec<String> = store
            .find_available_machines()
            .await
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(available, vec!["2"]);
    }

    #[tokio::test]
    async fn test_upsert_replaces_same_name() {
        let store = RecordStore::in_memory();
        store.upsert_machine(machine("1", "a")).await.unwrap();
        store.upsert_machine(machine("9", "a")).await.unwrap();

        let machines = store.list_machines().await;
        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].id, "9");

        let updated = store
            .update_machine("9", |m| m.status = MachineStatus::Stopped)
            .await
            .unwrap();
        assert_eq!(updated.status, MachineStatus::Stopped);
    }

    #[tokio::test]
    async fn test_snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");

        let store = RecordStore::open(&path).unwrap();
        let task = store.create_task(NewTask::new("persist me")).await.unwrap();
        store.mark_as_running(&task.id, "m1").await.unwrap();
        drop(store);

        let reopened = RecordStore::open(&path).unwrap();
        let loaded = reopened.get_task(&task.id).await.unwrap();
        assert_eq!(loaded.status, TaskStatus::Running);
        assert_eq!(loaded.instructions, "persist me");
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        fs::write(&path, b"{not json").unwrap();

        assert!(matches!(RecordStore::open(&path), Err(StoreError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn test_unknown_agent_rejected() {
        let store = RecordStore::in_memory();
        let new = NewTask {
            agent_id: Some(AgentId::new()),
            ..NewTask::new("x")
        };
        assert!(matches!(
            store.create_task(new).await,
            Err(StoreError::NotFound { kind: "agent", .. })
        ));
    }
}
