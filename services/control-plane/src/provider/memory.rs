//! In-memory provider backend for tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use super::{CloudProvider, ProviderError, ProviderResult, MANAGED_LABEL, NAME_LABEL};
use crate::machine::{InstanceSpec, Machine, MachineHealth, MachineStatus, ProviderKind};

/// Provider call recorded by [`InMemoryProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    Create(String),
    Destroy(String),
    Start(String),
    Stop(String),
}

/// Keeps machines in a vector and records every mutating call.
///
/// Created machines come up `running` with a loopback-range address.
pub struct InMemoryProvider {
    kind: ProviderKind,
    machines: Mutex<Vec<Machine>>,
    calls: Mutex<Vec<ProviderCall>>,
    next_id: AtomicU64,
    fail_creates: bool,
}

impl InMemoryProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            machines: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            fail_creates: false,
        }
    }

    /// A provider whose `create` always fails with a 503.
    pub fn failing_creates(kind: ProviderKind) -> Self {
        Self {
            fail_creates: true,
            ..Self::new(kind)
        }
    }

    /// Seeds a managed machine with the given name.
    pub fn with_machine(self, name: &str) -> Self {
        let machine = self.build(&InstanceSpec {
            provider: self.kind,
            name: name.to_string(),
            region: "fsn1".to_string(),
            instance_type: "cpx11".to_string(),
        });
        self.lock_machines().push(machine);
        self
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.lock_machines().iter().map(|m| m.name.clone()).collect()
    }

    fn lock_machines(&self) -> std::sync::MutexGuard<'_, Vec<Machine>> {
        self.machines.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn record(&self, call: ProviderCall) {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).push(call);
    }

    fn build(&self, spec: &InstanceSpec) -> Machine {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Machine {
            id: n.to_string(),
            name: spec.name.clone(),
            provider: self.kind,
            region: spec.region.clone(),
            instance_type: spec.instance_type.clone(),
            address: Some(format!("127.0.0.{}", n % 250 + 2)),
            status: MachineStatus::Running,
            health: MachineHealth::Unknown,
            created_at: Some(Utc::now()),
            tags: BTreeMap::from([
                (MANAGED_LABEL.to_string(), "true".to_string()),
                (NAME_LABEL.to_string(), spec.name.clone()),
            ]),
        }
    }

    fn set_status(&self, machine_id: &str, status: MachineStatus) {
        if let Some(m) = self.lock_machines().iter_mut().find(|m| m.id == machine_id) {
            m.status = status;
        }
    }
}

#[async_trait]
impl CloudProvider for InMemoryProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn list_managed(&self) -> ProviderResult<Vec<Machine>> {
        Ok(self.lock_machines().clone())
    }

    async fn create(&self, spec: &InstanceSpec) -> ProviderResult<Machine> {
        self.record(ProviderCall::Create(spec.name.clone()));
        if self.fail_creates {
            return Err(ProviderError::Api {
                provider: self.kind,
                status: 503,
                body: "capacity exhausted".to_string(),
            });
        }
        let machine = self.build(spec);
        info!(name = %machine.name, id = %machine.id, "[MOCK] Created machine");
        self.lock_machines().push(machine.clone());
        Ok(machine)
    }

    async fn destroy(&self, machine_id: &str) -> ProviderResult<()> {
        self.record(ProviderCall::Destroy(machine_id.to_string()));
        self.lock_machines().retain(|m| m.id != machine_id);
        Ok(())
    }

    async fn start(&self, machine_id: &str) -> ProviderResult<()> {
        self.record(ProviderCall::Start(machine_id.to_string()));
        self.set_status(machine_id, MachineStatus::Running);
        Ok(())
    }

    async fn stop(&self, machine_id: &str) -> ProviderResult<()> {
        self.record(ProviderCall::Stop(machine_id.to_string()));
        self.set_status(machine_id, MachineStatus::Stopped);
        Ok(())
    }
}
