use super::ContainerRuntime;
use crate::error::TrackerError;
use crate::types::PeerCount;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bollard::container::{ListContainersOptions, RestartContainerOptions};
use bollard::models::ContainerInspectResponse;
use bollard::Docker;
use log::{debug, info};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;

/// Seconds Docker waits for a graceful stop before killing on restart.
const RESTART_STOP_TIMEOUT: isize = 30;
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

pub struct DockerRuntime {
    docker: Docker,
    http: reqwest::Client,
    instance_prefix: String,
    network_name: Option<String>,
    status_port: u16,
    status_path: String,
}

impl DockerRuntime {
    pub fn new(
        instance_prefix: String,
        network_name: Option<String>,
        status_port: u16,
        status_path: String,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(STATUS_TIMEOUT).build()?;
        Ok(Self {
            docker: Self::connect()?,
            http,
            instance_prefix,
            network_name,
            status_port,
            status_path,
        })
    }

    fn connect() -> Result<Docker> {
        // Connect to the local Docker daemon using default settings.
        // This handles unix socket on Linux.
        Docker::connect_with_local_defaults().map_err(Into::into)
    }

    async fn inspect(&self, instance: &str) -> Result<ContainerInspectResponse> {
        self.docker
            .inspect_container(instance, None)
            .await
            .map_err(|e| anyhow!("Failed to inspect {}: {}", instance, e))
    }

    fn status_url(&self, ip: &str) -> String {
        if ip.contains(':') {
            format!("http://[{}]:{}{}", ip, self.status_port, self.status_path)
        } else {
            format!("http://{}:{}{}", ip, self.status_port, self.status_path)
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_instances(&self) -> Result<Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![self.instance_prefix.clone()]);
        let opts = ListContainersOptions::<String> {
            all: false,
            filters,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(opts)).await?;

        // The name filter matches substrings, so enforce the prefix here.
        let mut names: Vec<String> = containers
            .into_iter()
            .filter_map(|c| {
                c.names
                    .as_ref()
                    .and_then(|n| n.first())
                    .map(|n| n.trim_start_matches('/').to_string())
            })
            .filter(|name| name.starts_with(&self.instance_prefix))
            .collect();
        names.sort();
        debug!("Monitored instances: {:?}", names);
        Ok(names)
    }

    async fn peer_count(&self, instance: &str) -> Result<PeerCount> {
        let detail = self.inspect(instance).await?;
        let ip = get_ip_for_network(&detail, self.network_name.as_deref()).ok_or_else(|| {
            TrackerError::Status {
                instance: instance.to_string(),
                reason: "no address on the status network".into(),
            }
        })?;

        let status = |reason: String| TrackerError::Status {
            instance: instance.to_string(),
            reason,
        };
        let count = self
            .http
            .get(self.status_url(&ip))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| status(e.to_string()))?
            .json::<PeerCount>()
            .await
            .map_err(|e| status(e.to_string()))?;
        Ok(count)
    }

    async fn start_marker(&self, instance: &str) -> Result<String> {
        let detail = self.inspect(instance).await?;
        let id = detail.id.unwrap_or_default();
        let started_at = detail
            .state
            .and_then(|s| s.started_at)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("{} reports no start time", instance))?;

        let mut hasher = Sha256::new();
        hasher.update(id.as_bytes());
        hasher.update(b"|");
        hasher.update(started_at.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }

    async fn restart(&self, instance: &str) -> Result<()> {
        info!("Restarting instance {}", instance);
        self.docker
            .restart_container(
                instance,
                Some(RestartContainerOptions {
                    t: RESTART_STOP_TIMEOUT,
                }),
            )
            .await
            .map_err(|e| anyhow!("Failed to restart {}: {}", instance, e))
    }
}

/// Address of the container on `network_name`, or on the first network
/// that has one when no name is configured.
fn get_ip_for_network(
    detail: &ContainerInspectResponse,
    network_name: Option<&str>,
) -> Option<String> {
    let networks = detail.network_settings.as_ref()?.networks.as_ref()?;
    let pick = |net: &bollard::models::EndpointSettings| {
        net.ip_address
            .as_ref()
            .filter(|ip| !ip.is_empty())
            .or(net.global_ipv6_address.as_ref().filter(|ip| !ip.is_empty()))
            .cloned()
    };
    match network_name {
        Some(name) => networks.get(name).and_then(pick),
        None => {
            let mut names: Vec<&String> = networks.keys().collect();
            names.sort();
            names.into_iter().find_map(|name| networks.get(name).and_then(pick))
        }
    }
}
