//! Machine-local status store.
//!
//! Two kinds of records live under the working directory:
//!
//! ```text
//! <root>/machine-status.json          Busy Record: {currentTaskId, lastUpdated}
//! <root>/task_<id>/task-status.json   per-task lifecycle record
//! ```
//!
//! Every write goes to a `.tmp` sibling first and is renamed into place, so a
//! reader never sees a half-written file. Logical read-modify-write sequences
//! (availability check with stale-lock recovery, claim, finish) run under one
//! in-process mutex; this process is the only writer of these files.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use cloudagent_wire::{MachineStatusRecord, TaskState, TaskStatusRecord};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

const MACHINE_FILE: &str = "machine-status.json";
const TASK_FILE: &str = "task-status.json";
const TASK_DIR_PREFIX: &str = "task_";

/// Status store errors.
#[derive(Debug, Error)]
pub enum StatusStoreError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt status file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type StatusStoreResult<T> = Result<T, StatusStoreError>;

/// Result of reading the Busy Record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Available,
    Busy(TaskStatusRecord),
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available)
    }

    pub fn current_task(&self) -> Option<&TaskStatusRecord> {
        match self {
            Self::Available => None,
            Self::Busy(task) => Some(task),
        }
    }
}

/// Result of an atomic accept attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The Busy Record now references this task and its status is `running`.
    Accepted(TaskStatusRecord),

    /// Another task holds the machine.
    Busy(TaskStatusRecord),
}

/// File-backed status store for one machine.
#[derive(Debug)]
pub struct StatusStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl StatusStore {
    /// Opens the store, creating the working directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> StatusStoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StatusStoreError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory owned by one task; also the engine's working directory.
    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.root.join(format!("{TASK_DIR_PREFIX}{task_id}"))
    }

    fn task_path(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join(TASK_FILE)
    }

    fn machine_path(&self) -> PathBuf {
        self.root.join(MACHINE_FILE)
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        // The files are the source of truth; a panic elsewhere leaves
        // nothing half-applied in memory.
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reads the Busy Record, clearing it if it points at a terminal or
    /// missing task.
    pub fn is_available(&self) -> StatusStoreResult<Availability> {
        let _guard = self.guard();
        self.availability_locked()
    }

    /// Overwrites the Busy Record to reference `task_id`.
    ///
    /// Does not check availability; use [`StatusStore::try_claim`] on the
    /// accept path.
    pub fn set_busy(&self, task_id: &str) -> StatusStoreResult<()> {
        let _guard = self.guard();
        self.write_machine(&MachineStatusRecord::busy(task_id))
    }

    /// Empties the Busy Record.
    pub fn clear(&self) -> StatusStoreResult<()> {
        let _guard = self.guard();
        self.write_machine(&MachineStatusRecord::idle())
    }

    /// Check-and-set under a single lock: accept `task_id` only if the
    /// machine is free.
    pub fn try_claim(&self, task_id: &str) -> StatusStoreResult<Claim> {
        let _guard = self.guard();

        if let Availability::Busy(current) = self.availability_locked()? {
            return Ok(Claim::Busy(current));
        }

        // Busy Record first: a crash before the task record lands leaves a
        // reference to a missing task, which the next reader clears.
        self.write_machine(&MachineStatusRecord::busy(task_id))?;
        let record = TaskStatusRecord::running(task_id);
        self.write_task_locked(&record)?;

        info!(task_id, "Machine claimed");
        Ok(Claim::Accepted(record))
    }

    /// Moves a task to a terminal state and releases the Busy Record if it
    /// still references the task.
    ///
    /// The first terminal state wins: finishing an already finished task
    /// returns the stored record untouched.
    pub fn finish(
        &self,
        task_id: &str,
        status: TaskState,
        error: Option<String>,
    ) -> StatusStoreResult<TaskStatusRecord> {
        let _guard = self.guard();

        let mut record = match self.read_task_locked(task_id)? {
            Some(record) if record.status.is_terminal() => {
                debug!(task_id, status = %record.status, "Task already terminal");
                self.release_if_current(task_id)?;
                return Ok(record);
            }
            Some(record) => record,
            None => TaskStatusRecord::running(task_id),
        };

        record.finish(status, error);
        self.write_task_locked(&record)?;
        self.release_if_current(task_id)?;

        info!(task_id, status = %record.status, "Task finished");
        Ok(record)
    }

    /// Persists a task record.
    pub fn write_task(&self, record: &TaskStatusRecord) -> StatusStoreResult<()> {
        let _guard = self.guard();
        self.write_task_locked(record)
    }

    pub fn read_task(&self, task_id: &str) -> StatusStoreResult<Option<TaskStatusRecord>> {
        let _guard = self.guard();
        self.read_task_locked(task_id)
    }

    /// Every task with a readable status file, newest start time first.
    pub fn list_tasks(&self) -> StatusStoreResult<Vec<TaskStatusRecord>> {
        let _guard = self.guard();

        let entries = fs::read_dir(&self.root).map_err(|source| StatusStoreError::Io {
            path: self.root.clone(),
            source,
        })?;

        let mut tasks = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(task_id) = name.to_str().and_then(|n| n.strip_prefix(TASK_DIR_PREFIX)) else {
                continue;
            };
            match self.read_task_locked(task_id) {
                Ok(Some(record)) => tasks.push(record),
                Ok(None) => {}
                Err(e) => warn!(task_id, error = %e, "Skipping unreadable task status"),
            }
        }

        tasks.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(tasks)
    }

    /// Marks tasks left `running` by a previous process as failed.
    ///
    /// Called once at startup, before the HTTP boundary accepts requests.
    pub fn recover_interrupted(&self) -> StatusStoreResult<usize> {
        let running: Vec<String> = self
            .list_tasks()?
            .into_iter()
            .filter(|t| t.status == TaskState::Running)
            .map(|t| t.task_id)
            .collect();

        for task_id in &running {
            warn!(task_id = %task_id, "Task was running when the agent stopped");
            self.finish(
                task_id,
                TaskState::Failed,
                Some("Agent restarted during execution".to_string()),
            )?;
        }

        if !running.is_empty() {
            self.clear()?;
        }
        Ok(running.len())
    }

    fn availability_locked(&self) -> StatusStoreResult<Availability> {
        let Some(machine) = read_json::<MachineStatusRecord>(&self.machine_path())? else {
            return Ok(Availability::Available);
        };
        let Some(task_id) = machine.current_task_id else {
            return Ok(Availability::Available);
        };

        let current = match self.read_task_locked(&task_id) {
            Ok(current) => current,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Busy record points at unreadable task");
                None
            }
        };

        match current {
            Some(task) if !task.status.is_terminal() => Ok(Availability::Busy(task)),
            stale => {
                info!(
                    task_id = %task_id,
                    status = stale.as_ref().map(|t| t.status.as_str()).unwrap_or("missing"),
                    "Clearing stale busy record"
                );
                self.write_machine(&MachineStatusRecord::idle())?;
                Ok(Availability::Available)
            }
        }
    }

    fn release_if_current(&self, task_id: &str) -> StatusStoreResult<()> {
        let machine = read_json::<MachineStatusRecord>(&self.machine_path())?;
        if machine.and_then(|m| m.current_task_id).as_deref() == Some(task_id) {
            self.write_machine(&MachineStatusRecord::idle())?;
        }
        Ok(())
    }

    fn read_task_locked(&self, task_id: &str) -> StatusStoreResult<Option<TaskStatusRecord>> {
        read_json(&self.task_path(task_id))
    }

    fn write_task_locked(&self, record: &TaskStatusRecord) -> StatusStoreResult<()> {
        write_json_atomic(&self.task_path(&record.task_id), record)
    }

    fn write_machine(&self, record: &MachineStatusRecord) -> StatusStoreResult<()> {
        write_json_atomic(&self.machine_path(), record)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> StatusStoreResult<Option<T>> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StatusStoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|source| StatusStoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StatusStoreError {
    let path = path.to_path_buf();
    move |source| StatusStoreError::Io { path, source }
}

/// Write-to-temp then rename.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> StatusStoreResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }

    let content = serde_json::to_vec_pretty(value).map_err(|source| StatusStoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;

    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, &content).map_err(io_err(&tmp_path))?;
    fs::rename(&tmp_path, path).map_err(io_err(path))?;
    Ok(())
}
