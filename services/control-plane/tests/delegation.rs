//! Scheduler to machine agent, over real HTTP.
//!
//! Each test binds a machine agent on 127.0.0.1:0 backed by the mock engine
//! and points a one-machine fleet at it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cloudagent_control_plane::{
    fleet::{FleetResult, FleetSource},
    machine::{Machine, MachineHealth, MachineStatus, ProviderKind},
    prober::{HttpMachineApi, MachineApi},
    scheduler::{ScheduleOutcome, TaskScheduler},
    store::{NewTask, RecordStore, TaskRecord, TaskStatus},
};
use cloudagent_id::TaskId;
use cloudagent_machine_agent::{
    api, engine::MockEngine, executor::Executor, state::AppState, status_store::StatusStore,
};
use cloudagent_reconcile::RetryBudget;
use serde_json::json;
use tempfile::TempDir;

const KEY: &str = "sk_test";
const MACHINE_ID: &str = "1001";
const LOCALHOST: &str = "127.0.0.1";

struct OneMachine;

#[async_trait]
impl FleetSource for OneMachine {
    async fn list(&self) -> FleetResult<Vec<Machine>> {
        Ok(vec![Machine {
            id: MACHINE_ID.to_string(),
            name: "worker-1".to_string(),
            provider: ProviderKind::Hetzner,
            region: "fsn1".to_string(),
            instance_type: "cpx11".to_string(),
            address: Some(LOCALHOST.to_string()),
            status: MachineStatus::Running,
            health: MachineHealth::Healthy,
            created_at: None,
            tags: BTreeMap::new(),
        }])
    }
}

struct Harness {
    scheduler: Arc<TaskScheduler>,
    machines: Arc<HttpMachineApi>,
    port: u16,
    _dir: TempDir,
}

impl Harness {
    async fn start(engine: MockEngine) -> Self {
        let dir = TempDir::new().unwrap();
        let status = Arc::new(StatusStore::open(dir.path()).unwrap());
        let executor = Arc::new(Executor::new(status, Arc::new(engine)));
        let app = api::create_router(AppState::new(executor, KEY));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let machines = Arc::new(HttpMachineApi::new(KEY).with_port(port));
        let scheduler = Arc::new(TaskScheduler::new(
            Arc::new(RecordStore::in_memory()),
            Arc::new(OneMachine),
            machines.clone(),
            RetryBudget::new(Duration::from_millis(600), Duration::from_millis(100)),
        ));

        Self {
            scheduler,
            machines,
            port,
            _dir: dir,
        }
    }

    async fn task(&self, id: &TaskId) -> TaskRecord {
        self.scheduler.store().get_task(id).await.unwrap()
    }

    /// Refreshes until the task leaves `running`.
    async fn settle(&self, id: &TaskId) -> TaskRecord {
        for _ in 0..200 {
            self.scheduler.refresh_running().await.unwrap();
            let task = self.task(id).await;
            if task.status != TaskStatus::Running {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} never left running");
    }
}

#[tokio::test]
async fn test_submit_places_and_completes() {
    let harness = Harness::start(MockEngine::new(vec![
        json!({ "type": "assistant", "text": "working" }),
        json!({ "type": "result", "text": "done" }),
    ]))
    .await;

    let (task, outcome) = harness
        .scheduler
        .submit(NewTask::new("echo hello"))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ScheduleOutcome::Placed {
            machine_id: MACHINE_ID.to_string(),
            machine_name: "worker-1".to_string(),
            attempts: 1,
        }
    );
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.machine_id.as_deref(), Some(MACHINE_ID));
    assert!(task.started_at.is_some());

    let machine = harness.scheduler.store().get_machine(MACHINE_ID).await.unwrap();
    assert_eq!(machine.address.as_deref(), Some(LOCALHOST));

    let task = harness.settle(&task.id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.completed_at.is_some());
}

#[tokio::test]
async fn test_engine_failure_is_recorded() {
    let harness = Harness::start(MockEngine::failing("engine exploded")).await;

    let (task, outcome) = harness
        .scheduler
        .submit(NewTask::new("fail please"))
        .await
        .unwrap();
    assert!(outcome.is_placed());

    let task = harness.settle(&task.id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.is_some());
}

#[tokio::test]
async fn test_busy_machine_exhausts_budget() {
    let harness = Harness::start(MockEngine::stalled(Vec::new())).await;

    let (first, outcome) = harness
        .scheduler
        .submit(NewTask::new("hold the machine"))
        .await
        .unwrap();
    assert!(outcome.is_placed());
    assert!(!harness.machines.is_available(LOCALHOST).await);

    let (second, outcome) = harness
        .scheduler
        .submit(NewTask::new("no room"))
        .await
        .unwrap();
    assert!(matches!(outcome, ScheduleOutcome::Exhausted { attempts, .. } if attempts > 1));
    assert_eq!(second.status, TaskStatus::Failed);
    assert!(second
        .error
        .as_deref()
        .is_some_and(|e| e.contains("all machines remained busy")));

    assert_eq!(harness.task(&first.id).await.status, TaskStatus::Running);
}

#[tokio::test]
async fn test_cancel_frees_the_machine() {
    let harness = Harness::start(MockEngine::stalled(Vec::new())).await;

    let (task, _) = harness
        .scheduler
        .submit(NewTask::new("long job"))
        .await
        .unwrap();

    let outcome = harness.scheduler.cancel(&task.id).await.unwrap();
    assert_eq!(outcome.previous_status, TaskStatus::Running);
    assert_eq!(outcome.current_status, TaskStatus::Cancelled);

    let remote = harness
        .machines
        .task_status(LOCALHOST, &task.id.to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(remote.status, cloudagent_wire::TaskState::Cancelled);

    let mut available = false;
    for _ in 0..200 {
        if harness.machines.is_available(LOCALHOST).await {
            available = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(available, "machine stayed busy after cancel");
}

#[tokio::test]
async fn test_wrong_key_never_places() {
    let harness = Harness::start(MockEngine::new(Vec::new())).await;

    let intruder = TaskScheduler::new(
        Arc::new(RecordStore::in_memory()),
        Arc::new(OneMachine),
        Arc::new(HttpMachineApi::new("sk_wrong").with_port(harness.port)),
        RetryBudget::new(Duration::from_millis(300), Duration::from_millis(100)),
    );
    let (task, outcome) = intruder.submit(NewTask::new("sneak in")).await.unwrap();
    assert!(!outcome.is_placed());
    assert_eq!(task.status, TaskStatus::Failed);
}
