//! Fleet reconciliation.
//!
//! The observed fleet is every managed machine across the configured
//! providers. A sync destroys observed machines whose name is not desired,
//! creates desired machines with no observed counterpart, and returns the
//! fleet as re-listed afterwards.

use std::sync::Arc;

use async_trait::async_trait;
use cloudagent_reconcile::{convergence_status, diff_by_name, ConvergenceStatus, ReconcileError};
use futures_util::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::config::FleetConfig;
use crate::machine::{InstanceSpec, Machine, MachineHealth, MachineStatus, ProviderKind};
use crate::prober::MachineApi;
use crate::provider::{CloudProvider, ProviderError, ProviderRegistry};

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("no configuration for provider '{provider}' (needed by machine '{machine}')")]
    MissingProvider {
        provider: ProviderKind,
        machine: String,
    },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Plan(#[from] ReconcileError),
}

pub type FleetResult<T> = Result<T, FleetError>;

/// Read side of the fleet, as the scheduler sees it.
#[async_trait]
pub trait FleetSource: Send + Sync {
    /// Every managed machine with its remote health filled in.
    async fn list(&self) -> FleetResult<Vec<Machine>>;

    /// Machines that may receive a task, in listing order.
    async fn candidates(&self) -> FleetResult<Vec<Machine>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(Machine::is_schedulable)
            .collect())
    }
}

/// Outcome of [`FleetReconciler::sync`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub destroyed: Vec<String>,
    pub created: Vec<String>,
    pub unchanged: Vec<String>,
    /// The fleet as listed after applying the diff.
    pub fleet: Vec<Machine>,
}

/// Converges the observed fleet toward the configured instances.
pub struct FleetReconciler {
    registry: ProviderRegistry,
    desired: Vec<InstanceSpec>,
    machines: Arc<dyn MachineApi>,
}

impl FleetReconciler {
    pub fn new(
        registry: ProviderRegistry,
        desired: Vec<InstanceSpec>,
        machines: Arc<dyn MachineApi>,
    ) -> Self {
        Self {
            registry,
            desired,
            machines,
        }
    }

    /// Builds providers from the fleet file.
    pub fn from_config(
        config: &FleetConfig,
        machines: Arc<dyn MachineApi>,
    ) -> anyhow::Result<Self> {
        let registry = ProviderRegistry::from_config(config, config.provision_defaults()?)?;
        Ok(Self::new(registry, config.vm.instances.clone(), machines))
    }

    pub fn desired(&self) -> &[InstanceSpec] {
        &self.desired
    }

    /// Lists managed machines from every provider concurrently, without health.
    pub async fn observe(&self) -> FleetResult<Vec<Machine>> {
        let lists = join_all(self.registry.iter().map(|p| p.list_managed())).await;
        let mut machines = Vec::new();
        for list in lists {
            machines.extend(list?);
        }
        Ok(machines)
    }

    /// Fills in remote health for every machine concurrently.
    async fn with_health(&self, machines: Vec<Machine>) -> Vec<Machine> {
        join_all(machines.into_iter().map(|mut machine| async move {
            machine.health = match (&machine.address, machine.status) {
                (None, _) => MachineHealth::NoAddress,
                (Some(_), status) if status != MachineStatus::Running => MachineHealth::Unknown,
                (Some(address), _) => self.machines.health(address).await,
            };
            machine
        }))
        .await
    }

    fn provider_for(
        &self,
        kind: ProviderKind,
        machine: &str,
    ) -> FleetResult<Arc<dyn CloudProvider>> {
        self.registry
            .get(kind)
            .ok_or_else(|| FleetError::MissingProvider {
                provider: kind,
                machine: machine.to_string(),
            })
    }

    pub async fn status(&self) -> FleetResult<ConvergenceStatus> {
        let observed = self.observe().await?;
        Ok(convergence_status(
            observed.iter().map(|m| m.name.as_str()),
            self.desired.iter().map(|d| d.name.as_str()),
        ))
    }

    /// Applies the minimal create/destroy diff, then re-lists.
    ///
    /// Every provider is resolved before any call is made, so a missing
    /// provider fails the pass without side effects. Provider errors surface
    /// after all in-flight calls finish; calls that succeeded stay applied.
    #[instrument(skip(self))]
    pub async fn sync(&self) -> FleetResult<SyncReport> {
        let observed = self.observe().await?;
        let diff = diff_by_name(
            observed,
            self.desired.clone(),
            |m| m.name.as_str(),
            |d| d.name.as_str(),
        )?;

        let destroys = diff
            .to_destroy
            .iter()
            .map(|m| -> FleetResult<_> { Ok((self.provider_for(m.provider, &m.name)?, m)) })
            .collect::<FleetResult<Vec<_>>>()?;
        let creates = diff
            .to_create
            .iter()
            .map(|spec| -> FleetResult<_> {
                Ok((self.provider_for(spec.provider, &spec.name)?, spec))
            })
            .collect::<FleetResult<Vec<_>>>()?;

        info!(
            destroy = destroys.len(),
            create = creates.len(),
            unchanged = diff.unchanged.len(),
            "Applying fleet diff"
        );

        let (destroyed, created) = tokio::join!(
            join_all(destroys.into_iter().map(|(provider, machine)| async move {
                provider.destroy(&machine.id).await.map(|()| machine.name.clone())
            })),
            join_all(creates.into_iter().map(|(provider, spec)| async move {
                provider.create(spec).await.map(|m| m.name)
            })),
        );

        let mut first_error = None;
        let mut report = SyncReport {
            destroyed: Vec::new(),
            created: Vec::new(),
            unchanged: diff.unchanged.iter().map(|m| m.name.clone()).collect(),
            fleet: Vec::new(),
        };
        for result in destroyed {
            match result {
                Ok(name) => report.destroyed.push(name),
                Err(e) => {
                    warn!(error = %e, "Destroy failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        for result in created {
            match result {
                Ok(name) => report.created.push(name),
                Err(e) => {
                    warn!(error = %e, "Create failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e.into());
        }

        report.fleet = FleetSource::list(self).await?;
        info!(
            destroyed = report.destroyed.len(),
            created = report.created.len(),
            fleet = report.fleet.len(),
            "Fleet sync complete"
        );
        Ok(report)
    }

    /// Destroys every observed machine regardless of desired state.
    #[instrument(skip(self))]
    pub async fn destroy_all(&self) -> FleetResult<Vec<Machine>> {
        let observed = self.observe().await?;
        let targets = observed
            .into_iter()
            .map(|m| -> FleetResult<_> { Ok((self.provider_for(m.provider, &m.name)?, m)) })
            .collect::<FleetResult<Vec<_>>>()?;

        let results = join_all(targets.into_iter().map(|(provider, machine)| async move {
            provider.destroy(&machine.id).await.map(|()| machine)
        }))
        .await;

        let mut destroyed = Vec::new();
        for result in results {
            destroyed.push(result?);
        }
        info!(count = destroyed.len(), "Destroyed all machines");
        Ok(destroyed)
    }
}

#[async_trait]
impl FleetSource for FleetReconciler {
    async fn list(&self) -> FleetResult<Vec<Machine>> {
        let observed = self.observe().await?;
        Ok(self.with_health(observed).await)
    }
}
