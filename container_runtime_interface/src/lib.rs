//! Capability set the test environment needs from a container engine.
//!
//! Every method is a single call to the engine. None of them retry; waiting and
//! retrying belong to the caller.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub use testenv_shared_types::{
    ContainerId, ContainerKind, ImageId, NetworkId, NetworkIdentity, Result, RuntimeError,
};

/// Raw bytes produced by the engine (image pull progress, container logs).
pub type ByteStream = BoxStream<'static, Result<Vec<u8>>>;

/// Credentials for pulling from a private registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
    /// Registry host, if it differs from the one in the image reference.
    #[serde(default)]
    pub server_address: Option<String>,
}

impl RegistryCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            server_address: None,
        }
    }
}

/// Options for creating a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateContainerOptions {
    pub image: String,
    /// `KEY=value` entries.
    pub env: Vec<String>,
    /// host port -> container port. Container ports without a protocol are tcp.
    pub port_bindings: HashMap<String, String>,
    /// `host_path:container_path` bind mounts.
    pub volume_bindings: Vec<String>,
    /// Network to attach at creation time.
    pub network_id: Option<NetworkId>,
    /// Container name; doubles as its hostname inside the network.
    pub name: Option<String>,
}

impl CreateContainerOptions {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create_network(&self, name: &str) -> Result<NetworkIdentity>;

    /// Starts pulling an image. The returned stream carries progress output and
    /// must be drained for the pull to complete.
    async fn pull_image(
        &self,
        image: &str,
        credentials: Option<&RegistryCredentials>,
    ) -> Result<ByteStream>;

    async fn create_container(&self, options: &CreateContainerOptions) -> Result<ContainerId>;

    async fn start_container(&self, container_id: &str) -> Result<()>;

    /// Blocks until the container stops or `timeout` elapses, after which the
    /// engine kills it.
    async fn stop_container(&self, container_id: &str, timeout: Duration) -> Result<()>;

    /// Removes a container whether or not it is running. Fails with
    /// [`RuntimeError::NotFound`] if the container does not exist.
    async fn force_remove_container(&self, container_id: &str) -> Result<()>;

    async fn force_remove_image(&self, image: &str) -> Result<()>;

    async fn remove_network(&self, network_id: &str) -> Result<()>;

    async fn connect_to_network(&self, container_id: &str, network_id: &str) -> Result<()>;

    /// IP address assigned to the container inside the named network.
    async fn inspect_ip_address(&self, container_id: &str, network_name: &str) -> Result<String>;

    /// Follows stdout and stderr emitted since `since` (unix seconds). The stream
    /// ends when the container is removed.
    async fn stream_logs(&self, container_id: &str, since: i64) -> Result<ByteStream>;
}
