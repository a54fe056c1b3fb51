//! Hetzner Cloud backend.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::{CloudProvider, ProviderError, ProviderResult, MANAGED_LABEL, NAME_LABEL};
use crate::config::ProvisionDefaults;
use crate::machine::{InstanceSpec, Machine, MachineHealth, MachineStatus, ProviderKind};

pub const HETZNER_API_URL: &str = "https://api.hetzner.cloud/v1";

pub const SUPPORTED_REGIONS: &[&str] = &["fsn1", "nbg1", "hel1", "ash", "hil"];

pub const INSTANCE_TYPES: &[&str] = &["cpx11", "cpx21", "cpx31", "cpx41", "cpx51"];

const DEFAULT_IMAGE: &str = "ubuntu-24.04";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PAGE_SIZE: u32 = 50;

const KIND: ProviderKind = ProviderKind::Hetzner;

/// Talks to the Hetzner Cloud REST API with a project token.
#[derive(Debug, Clone)]
pub struct HetznerProvider {
    client: Client,
    base_url: String,
    token: String,
    defaults: ProvisionDefaults,
}

#[derive(Debug, Deserialize)]
struct ServerList {
    servers: Vec<Server>,
    #[serde(default)]
    meta: Option<Meta>,
}

#[derive(Debug, Deserialize)]
struct Meta {
    pagination: Pagination,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    next_page: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ServerEnvelope {
    server: Server,
}

#[derive(Debug, Deserialize)]
struct Server {
    id: u64,
    name: String,
    status: String,
    created: Option<DateTime<Utc>>,
    public_net: PublicNet,
    server_type: NamedRef,
    datacenter: Datacenter,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct PublicNet {
    ipv4: Option<Ipv4>,
}

#[derive(Debug, Deserialize)]
struct Ipv4 {
    ip: String,
}

#[derive(Debug, Deserialize)]
struct NamedRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Datacenter {
    location: NamedRef,
}

#[derive(Debug, Serialize)]
struct CreateServer<'a> {
    name: &'a str,
    server_type: &'a str,
    image: &'a str,
    location: &'a str,
    start_after_create: bool,
    labels: BTreeMap<&'a str, &'a str>,
    #[serde(skip_serializing_if = "is_empty_slice")]
    ssh_keys: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    user_data: Option<&'a str>,
    public_net: PublicNetRequest,
}

#[derive(Debug, Serialize)]
struct PublicNetRequest {
    enable_ipv4: bool,
    enable_ipv6: bool,
}

fn is_empty_slice(keys: &&[String]) -> bool {
    keys.is_empty()
}

/// Maps a Hetzner server status onto the machine lifecycle.
pub fn map_status(status: &str) -> MachineStatus {
    match status {
        "initializing" | "starting" | "rebuilding" => MachineStatus::Creating,
        "running" | "migrating" => MachineStatus::Running,
        "stopping" | "off" => MachineStatus::Stopped,
        "deleting" => MachineStatus::Deleted,
        _ => MachineStatus::Error,
    }
}

impl Server {
    fn into_machine(self) -> Machine {
        Machine {
            id: self.id.to_string(),
            name: self.name,
            provider: KIND,
            region: self.datacenter.location.name,
            instance_type: self.server_type.name,
            address: self.public_net.ipv4.map(|v4| v4.ip),
            status: map_status(&self.status),
            health: MachineHealth::Unknown,
            created_at: self.created,
            tags: self.labels,
        }
    }
}

impl HetznerProvider {
    pub fn new(token: &str, defaults: ProvisionDefaults) -> ProviderResult<Self> {
        Self::with_base_url(HETZNER_API_URL, token, defaults)
    }

    /// Points the backend at a different API root.
    pub fn with_base_url(
        base_url: &str,
        token: &str,
        defaults: ProvisionDefaults,
    ) -> ProviderResult<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| ProviderError::Transport {
                provider: KIND,
                source,
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            defaults,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
    }

    async fn send(&self, request: RequestBuilder, action: &str) -> ProviderResult<Response> {
        let response = request
            .send()
            .await
            .map_err(|source| ProviderError::Transport {
                provider: KIND,
                source,
            })?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(api_error(response, action).await)
    }

    async fn server_action(&self, machine_id: &str, action: &str) -> ProviderResult<()> {
        let path = format!("/servers/{machine_id}/actions/{action}");
        self.send(self.request(Method::POST, &path), action).await?;
        info!(machine_id = %machine_id, action = %action, "Hetzner server action issued");
        Ok(())
    }
}

async fn api_error(response: Response, action: &str) -> ProviderError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    error!(status, body = %body, action = %action, "Hetzner API request failed");
    ProviderError::Api {
        provider: KIND,
        status,
        body,
    }
}

async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> ProviderResult<T> {
    response
        .json::<T>()
        .await
        .map_err(|e| ProviderError::Malformed {
            provider: KIND,
            message: e.to_string(),
        })
}

#[async_trait]
impl CloudProvider for HetznerProvider {
    fn kind(&self) -> ProviderKind {
        KIND
    }

    async fn list_managed(&self) -> ProviderResult<Vec<Machine>> {
        let selector = format!("{MANAGED_LABEL}=true");
        let mut machines = Vec::new();
        let mut page = 1;

        loop {
            let request = self.request(Method::GET, "/servers").query(&[
                ("label_selector", selector.clone()),
                ("page", page.to_string()),
                ("per_page", PAGE_SIZE.to_string()),
            ]);
            let list: ServerList = decode(self.send(request, "list").await?).await?;
            machines.extend(list.servers.into_iter().map(Server::into_machine));

            match list.meta.and_then(|m| m.pagination.next_page) {
                Some(next) if next > page => page = next,
                _ => break,
            }
        }

        debug!(count = machines.len(), "Listed Hetzner servers");
        Ok(machines)
    }

    async fn create(&self, spec: &InstanceSpec) -> ProviderResult<Machine> {
        if !SUPPORTED_REGIONS.contains(&spec.region.as_str()) {
            return Err(ProviderError::Unsupported {
                provider: KIND,
                what: "region",
                value: spec.region.clone(),
            });
        }
        if !INSTANCE_TYPES.contains(&spec.instance_type.as_str()) {
            return Err(ProviderError::Unsupported {
                provider: KIND,
                what: "instance type",
                value: spec.instance_type.clone(),
            });
        }

        let body = CreateServer {
            name: &spec.name,
            server_type: &spec.instance_type,
            image: DEFAULT_IMAGE,
            location: &spec.region,
            start_after_create: true,
            labels: BTreeMap::from([(MANAGED_LABEL, "true"), (NAME_LABEL, spec.name.as_str())]),
            ssh_keys: &self.defaults.ssh_keys,
            user_data: self.defaults.user_data.as_deref(),
            public_net: PublicNetRequest {
                enable_ipv4: true,
                enable_ipv6: false,
            },
        };

        let request = self.request(Method::POST, "/servers").json(&body);
        let created: ServerEnvelope = decode(self.send(request, "create").await?).await?;
        let machine = created.server.into_machine();
        info!(name = %machine.name, id = %machine.id, region = %machine.region, "Created Hetzner server");
        Ok(machine)
    }

    async fn destroy(&self, machine_id: &str) -> ProviderResult<()> {
        let path = format!("/servers/{machine_id}");
        let response = self
            .request(Method::DELETE, &path)
            .send()
            .await
            .map_err(|source| ProviderError::Transport {
                provider: KIND,
                source,
            })?;

        match response.status() {
            s if s.is_success() => {
                info!(machine_id = %machine_id, "Deleted Hetzner server");
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                debug!(machine_id = %machine_id, "Hetzner server already gone");
                Ok(())
            }
            _ => Err(api_error(response, "destroy").await),
        }
    }

    async fn start(&self, machine_id: &str) -> ProviderResult<()> {
        self.server_action(machine_id, "poweron").await
    }

    async fn stop(&self, machine_id: &str) -> ProviderResult<()> {
        self.server_action(machine_id, "shutdown").await
    }
}
