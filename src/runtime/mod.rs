use crate::types::PeerCount;
use anyhow::Result;
use async_trait::async_trait;

pub mod docker;
pub use docker::DockerRuntime;

/// Control and status surface of the monitored proxy instances.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Names of the instances currently running.
    async fn list_instances(&self) -> Result<Vec<String>>;

    /// Peer counts from the instance's own status feed.
    async fn peer_count(&self, instance: &str) -> Result<PeerCount>;

    /// Opaque identity of the instance's current run.
    async fn start_marker(&self, instance: &str) -> Result<String>;

    async fn restart(&self, instance: &str) -> Result<()>;
}
