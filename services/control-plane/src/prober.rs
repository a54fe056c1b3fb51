//! Client side of the machine HTTP boundary.
//!
//! [`MachineApi`] is everything the control plane asks of a machine agent:
//! health, availability, delegation, status polling and cancellation.
//! Probing never fails loudly; network errors, timeouts and non-success
//! responses all read as "unavailable" so the scheduler can move on.

use std::time::Duration;

use async_trait::async_trait;
use cloudagent_reconcile::DEFAULT_PROBE_TIMEOUT;
use cloudagent_wire::{
    paths, AvailabilityResponse, NdjsonDecoder, ProgressEvent, RunTaskRequest, TaskStatusRecord,
    TaskStatusResponse, WireError, API_KEY_HEADER, DEFAULT_MACHINE_PORT,
};
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};

use crate::machine::MachineHealth;

/// How long delegation may take to see the `started` event.
pub const DEFAULT_DELEGATION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum DelegationError {
    /// The machine's atomic accept failed; another task holds it.
    #[error("machine is busy")]
    Busy,

    #[error("machine rejected the task with {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("progress stream ended before execution started")]
    StreamEnded,

    #[error("execution failed before it started: {0}")]
    Failed(String),

    #[error("no start confirmation within {0:?}")]
    Timeout(Duration),

    #[error("request to machine failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed progress stream: {0}")]
    Decode(#[from] WireError),
}

impl DelegationError {
    /// Whether the machine may have begun the task anyway.
    ///
    /// Only an explicit refusal, a reported failure, or a request that never
    /// reached the machine rules that out.
    pub fn may_be_running(&self) -> bool {
        match self {
            Self::Busy | Self::Rejected { .. } | Self::Failed(_) => false,
            Self::Transport(e) => !(e.is_connect() || e.is_builder()),
            Self::StreamEnded | Self::Timeout(_) | Self::Decode(_) => true,
        }
    }
}

/// Operations against a single machine agent, addressed by IP or host name.
#[async_trait]
pub trait MachineApi: Send + Sync {
    async fn health(&self, address: &str) -> MachineHealth;

    /// True only on a successful response reporting `available: true`.
    async fn is_available(&self, address: &str) -> bool;

    /// Commits a task. Returns once the machine confirms execution began.
    async fn delegate(&self, address: &str, request: &RunTaskRequest)
        -> Result<(), DelegationError>;

    /// The machine's view of a task, or `None` if it has never heard of it.
    async fn task_status(
        &self,
        address: &str,
        task_id: &str,
    ) -> Result<Option<TaskStatusRecord>, DelegationError>;

    async fn cancel(&self, address: &str, task_id: &str) -> Result<(), DelegationError>;
}

/// [`MachineApi`] over HTTP with the shared key.
#[derive(Debug, Clone)]
pub struct HttpMachineApi {
    client: Client,
    api_key: String,
    port: u16,
    probe_timeout: Duration,
    delegation_timeout: Duration,
}

impl HttpMachineApi {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            port: DEFAULT_MACHINE_PORT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            delegation_timeout: DEFAULT_DELEGATION_TIMEOUT,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_delegation_timeout(mut self, timeout: Duration) -> Self {
        self.delegation_timeout = timeout;
        self
    }

    fn url(&self, address: &str, path: &str) -> String {
        format!("http://{}:{}{}", address, self.port, path)
    }

    fn get(&self, address: &str, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(self.url(address, path))
            .header(API_KEY_HEADER, &self.api_key)
    }

    fn post(&self, address: &str, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(self.url(address, path))
            .header(API_KEY_HEADER, &self.api_key)
    }

    async fn start_run(
        &self,
        address: &str,
        request: &RunTaskRequest,
    ) -> Result<(), DelegationError> {
        let response = self.post(address, paths::RUN).json(request).send().await?;

        match response.status() {
            StatusCode::CONFLICT => return Err(DelegationError::Busy),
            s if !s.is_success() => {
                let body = response.text().await.unwrap_or_default();
                return Err(DelegationError::Rejected {
                    status: s.as_u16(),
                    body,
                });
            }
            _ => {}
        }

        let mut stream = response.bytes_stream();
        let mut decoder = NdjsonDecoder::new();
        while let Some(chunk) = stream.next().await {
            for event in decoder.push(&chunk?) {
                match event? {
                    ProgressEvent::Started { .. } => return Ok(()),
                    ProgressEvent::Error { error, .. } => return Err(DelegationError::Failed(error)),
                    _ => {}
                }
            }
        }

        match decoder.finish().transpose()? {
            Some(ProgressEvent::Started { .. }) => Ok(()),
            Some(ProgressEvent::Error { error, .. }) => Err(DelegationError::Failed(error)),
            _ => Err(DelegationError::StreamEnded),
        }
    }
}

#[async_trait]
impl MachineApi for HttpMachineApi {
    async fn health(&self, address: &str) -> MachineHealth {
        let result = self
            .client
            .get(self.url(address, paths::HEALTH))
            .timeout(self.probe_timeout)
            .send()
            .await;
        match result {
            Ok(r) if r.status().is_success() => MachineHealth::Healthy,
            Ok(r) => {
                debug!(address, status = %r.status(), "Health check returned non-success");
                MachineHealth::Unhealthy
            }
            Err(e) => {
                debug!(address, error = %e, "Health check failed");
                MachineHealth::Unhealthy
            }
        }
    }

    async fn is_available(&self, address: &str) -> bool {
        let result = self
            .get(address, paths::AVAILABILITY)
            .timeout(self.probe_timeout)
            .send()
            .await;
        let response = match result {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(address, status = %r.status(), "Availability probe returned non-success");
                return false;
            }
            Err(e) => {
                debug!(address, error = %e, "Availability probe failed");
                return false;
            }
        };
        match response.json::<AvailabilityResponse>().await {
            Ok(body) => body.available,
            Err(e) => {
                debug!(address, error = %e, "Availability probe returned an unreadable body");
                false
            }
        }
    }

    async fn delegate(
        &self,
        address: &str,
        request: &RunTaskRequest,
    ) -> Result<(), DelegationError> {
        let result = tokio::time::timeout(self.delegation_timeout, self.start_run(address, request))
            .await
            .unwrap_or(Err(DelegationError::Timeout(self.delegation_timeout)));

        if let Err(e) = &result {
            if e.may_be_running() {
                if let Err(cancel_err) = self.cancel(address, &request.task_id).await {
                    warn!(
                        address,
                        task_id = %request.task_id,
                        error = %cancel_err,
                        "Best-effort cancel after failed delegation did not succeed"
                    );
                }
            }
        }
        result
    }

    async fn task_status(
        &self,
        address: &str,
        task_id: &str,
    ) -> Result<Option<TaskStatusRecord>, DelegationError> {
        let response = self
            .get(address, &paths::task_status(task_id))
            .timeout(self.probe_timeout)
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let body: TaskStatusResponse = response.json().await?;
                Ok(Some(body.task_status))
            }
            s => Err(DelegationError::Rejected {
                status: s.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn cancel(&self, address: &str, task_id: &str) -> Result<(), DelegationError> {
        let response = self
            .post(address, &paths::task_cancel(task_id))
            .timeout(self.probe_timeout)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(DelegationError::Rejected {
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_machine_is_unavailable_and_unhealthy() {
        // Port 9 on loopback is closed in any sane test environment.
        let api = HttpMachineApi::new("sk_test")
            .with_port(9)
            .with_probe_timeout(Duration::from_millis(500));

        assert!(!api.is_available("127.0.0.1").await);
        assert_eq!(api.health("127.0.0.1").await, MachineHealth::Unhealthy);
    }

    #[test]
    fn test_only_ambiguous_failures_trigger_cancel() {
        assert!(DelegationError::StreamEnded.may_be_running());
        assert!(DelegationError::Timeout(Duration::from_secs(1)).may_be_running());
        assert!(!DelegationError::Busy.may_be_running());
        assert!(!DelegationError::Failed("x".to_string()).may_be_running());
        assert!(!DelegationError::Rejected {
            status: 401,
            body: String::new()
        }
        .may_be_running());
    }

    #[tokio::test]
    async fn test_refused_connection_is_not_ambiguous() {
        let err = HttpMachineApi::new("sk_test")
            .with_port(9)
            .start_run("127.0.0.1", &RunTaskRequest {
                task_id: "tsk_x".to_string(),
                instructions: "noop".to_string(),
                options: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DelegationError::Transport(_)));
        assert!(!err.may_be_running());
    }
}
