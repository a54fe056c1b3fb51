//! Task executor.
//!
//! Ties the status store to the engine. Accepting a task is a single
//! check-and-set on the store; once accepted, execution runs on its own tokio
//! task so that the HTTP caller may hang up after the `started` event without
//! affecting the run. Every exit path (success, engine error, hard timeout,
//! cancellation) writes a terminal status and releases the Busy Record.

use std::sync::{Arc, Mutex};

use cloudagent_wire::{ProgressEvent, RunTaskRequest, TaskState, TaskStatusRecord};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, instrument, warn};

use crate::engine::{Engine, EngineRequest};
use crate::status_store::{Availability, Claim, StatusStore, StatusStoreError};

/// Buffered engine messages between the engine and the executor loop.
const ENGINE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("machine is busy")]
    Busy(Box<TaskStatusRecord>),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task {} already {}", .0.task_id, .0.status)]
    AlreadyFinished(Box<TaskStatusRecord>),

    #[error(transparent)]
    Store(#[from] StatusStoreError),
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Handle to the currently executing task.
struct Running {
    task_id: String,
    cancel: watch::Sender<bool>,
}

pub struct Executor {
    store: Arc<StatusStore>,
    engine: Arc<dyn Engine>,
    running: Mutex<Option<Running>>,
}

enum Exit {
    Finished(Result<(), crate::engine::EngineError>),
    TimedOut,
    Cancelled,
}

impl Executor {
    pub fn new(store: Arc<StatusStore>, engine: Arc<dyn Engine>) -> Self {
        Self {
            store,
            engine,
            running: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<StatusStore> {
        &self.store
    }

    /// Accepts `request` if the machine is free and starts executing it.
    ///
    /// The returned receiver yields `started` first and a terminal event
    /// last. Dropping it does not stop execution.
    pub fn start(
        self: &Arc<Self>,
        request: RunTaskRequest,
    ) -> ExecutorResult<mpsc::UnboundedReceiver<ProgressEvent>> {
        let task_id = request.task_id.clone();

        // The slot stays locked across claim and registration so a cancel
        // always finds the run it is cancelling.
        let mut slot = self.slot();
        if let Some(current) = slot.as_ref() {
            let current = self.record_of(&current.task_id)?;
            info!(task_id = %task_id, current = %current.task_id, "Rejecting task, previous run still active");
            return Err(ExecutorError::Busy(Box::new(current)));
        }

        match self.store.try_claim(&task_id)? {
            Claim::Busy(current) => {
                info!(task_id = %task_id, current = %current.task_id, "Rejecting task, machine busy");
                return Err(ExecutorError::Busy(Box::new(current)));
            }
            Claim::Accepted(_) => {}
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = events_tx.send(ProgressEvent::started(&task_id));

        let (cancel_tx, cancel_rx) = watch::channel(false);
        *slot = Some(Running {
            task_id: task_id.clone(),
            cancel: cancel_tx,
        });
        drop(slot);

        let engine_request = EngineRequest {
            task_id,
            instructions: request.instructions.clone(),
            options: request.effective_options(),
            working_dir: self.store.task_dir(&request.task_id),
        };

        let executor = Arc::clone(self);
        tokio::spawn(async move {
            executor.run(engine_request, events_tx, cancel_rx).await;
        });

        Ok(events_rx)
    }

    /// Cancels a task on this machine.
    ///
    /// Cancelling an already cancelled task returns its record; any other
    /// terminal task is reported as [`ExecutorError::AlreadyFinished`].
    pub fn cancel(&self, task_id: &str) -> ExecutorResult<TaskStatusRecord> {
        let slot = self.slot();
        let Some(existing) = self.store.read_task(task_id)? else {
            return Err(ExecutorError::NotFound(task_id.to_string()));
        };

        match existing.status {
            TaskState::Cancelled => return Ok(existing),
            state if state.is_terminal() => {
                return Err(ExecutorError::AlreadyFinished(Box::new(existing)))
            }
            _ => {}
        }

        let record = self.store.finish(
            task_id,
            TaskState::Cancelled,
            Some("Task cancelled".to_string()),
        )?;

        // The slot itself is released by `run` once the engine is gone.
        if let Some(running) = slot.as_ref().filter(|r| r.task_id == task_id) {
            let _ = running.cancel.send(true);
        }

        info!(task_id, "Task cancelled");
        Ok(record)
    }

    /// Whether a new task would be accepted right now.
    ///
    /// A run that is still shutting down keeps the machine busy even after
    /// its Busy Record was released.
    pub fn availability(&self) -> ExecutorResult<Availability> {
        let slot = self.slot();
        if let Some(current) = slot.as_ref() {
            return Ok(Availability::Busy(self.record_of(&current.task_id)?));
        }
        Ok(self.store.is_available()?)
    }

    fn record_of(&self, task_id: &str) -> ExecutorResult<TaskStatusRecord> {
        Ok(self
            .store
            .read_task(task_id)?
            .unwrap_or_else(|| TaskStatusRecord::running(task_id)))
    }

    /// Id of the task executing in this process, if any.
    pub fn current_task(&self) -> Option<String> {
        self.slot().as_ref().map(|r| r.task_id.clone())
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[instrument(skip_all, fields(task_id = %request.task_id))]
    async fn run(
        &self,
        request: EngineRequest,
        events: mpsc::UnboundedSender<ProgressEvent>,
        mut cancel: watch::Receiver<bool>,
    ) {
        let task_id = request.task_id.clone();
        let timeout = request.options.timeout();

        let (sink, mut messages) = mpsc::channel(ENGINE_CHANNEL_CAPACITY);
        let execution = self.engine.execute(request, sink);
        tokio::pin!(execution);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut count: u64 = 0;
        let exit = loop {
            tokio::select! {
                biased;
                Some(message) = messages.recv() => {
                    count += 1;
                    let _ = events.send(ProgressEvent::message(message, count));
                }
                result = &mut execution => break Exit::Finished(result),
                _ = &mut deadline => break Exit::TimedOut,
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break Exit::Cancelled;
                    }
                }
            }
        };

        // Dropping the engine future aborts whatever it was running.
        drop(execution);
        while let Ok(message) = messages.try_recv() {
            count += 1;
            let _ = events.send(ProgressEvent::message(message, count));
        }

        let (state, error) = match exit {
            Exit::Finished(Ok(())) => (TaskState::Completed, None),
            Exit::Finished(Err(e)) => (TaskState::Failed, Some(e.to_string())),
            Exit::TimedOut => {
                warn!(timeout_secs = timeout.as_secs(), "Task timed out");
                (
                    TaskState::Failed,
                    Some(format!("Task timed out after {}s", timeout.as_secs())),
                )
            }
            Exit::Cancelled => (TaskState::Cancelled, Some("Task cancelled".to_string())),
        };

        let final_event = match self.store.finish(&task_id, state, error) {
            Ok(record) => match (record.status, record.error) {
                (TaskState::Completed, _) => ProgressEvent::completed(count),
                (_, error) => ProgressEvent::error(error.unwrap_or_else(|| record.status.to_string())),
            },
            Err(e) => {
                error!(error = %e, "Failed to record task outcome");
                ProgressEvent::error(format!("Failed to record task outcome: {e}"))
            }
        };
        let _ = events.send(final_event);

        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|r| r.task_id == task_id) {
            *slot = None;
        }
        info!(messages = count, "Task execution finished");
    }
}
