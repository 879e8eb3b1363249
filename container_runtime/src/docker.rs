//! Docker API container runtime.
//!
//! This module implements [`ContainerRuntime`] on top of the Docker engine API
//! via `bollard`. Podman works as well when its Docker-compatible socket is
//! enabled.
//!
//! # Requirements
//!
//! - A reachable engine socket (`DOCKER_HOST` or the platform default)
//! - Permission to create networks and containers
//!
//! # Timeouts
//!
//! Every request except image pulls and log streaming is bounded by
//! [`DockerRuntimeConfig::command_timeout`]. Stopping a container additionally
//! allows the stop grace period on top of it.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions as DockerCreateOptions, InspectContainerOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{CreateImageOptions, RemoveImageOptions};
use bollard::models::{EndpointSettings, HostConfig, PortBinding};
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions, InspectNetworkOptions};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::{StreamExt, TryStreamExt};
use tracing::{debug, info};

use container_runtime_interface::{
    ByteStream, ContainerId, ContainerRuntime, CreateContainerOptions, NetworkIdentity,
    RegistryCredentials,
};
use testenv_shared_types::{Result, RuntimeError};

/// Errors raised while connecting to the engine.
#[derive(Debug, thiserror::Error)]
pub enum DockerConnectError {
    #[error("Cannot connect to Docker engine: {0}")]
    Connect(#[from] BollardError),

    #[error("Docker engine did not answer within {0:?}")]
    Timeout(Duration),
}

impl From<DockerConnectError> for RuntimeError {
    fn from(err: DockerConnectError) -> Self {
        RuntimeError::Connection(err.to_string())
    }
}

/// Configuration for [`DockerRuntime`].
#[derive(Debug, Clone)]
pub struct DockerRuntimeConfig {
    /// Unix socket of the engine. `None` uses `DOCKER_HOST` or the platform default.
    pub socket_path: Option<PathBuf>,
    /// Timeout for a single API request (default: 60s)
    pub command_timeout: Duration,
}

impl Default for DockerRuntimeConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            command_timeout: Duration::from_secs(60),
        }
    }
}

/// Container runtime backed by the Docker engine API.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    config: DockerRuntimeConfig,
    docker: Docker,
}

impl DockerRuntime {
    /// Connect with default configuration.
    pub async fn new() -> std::result::Result<Self, DockerConnectError> {
        Self::with_config(DockerRuntimeConfig::default()).await
    }

    /// Connect with custom configuration and verify the engine answers.
    pub async fn with_config(
        config: DockerRuntimeConfig,
    ) -> std::result::Result<Self, DockerConnectError> {
        let docker = match &config.socket_path {
            Some(path) => Docker::connect_with_socket(
                &path.to_string_lossy(),
                config.command_timeout.as_secs(),
                API_DEFAULT_VERSION,
            )?,
            None => Docker::connect_with_local_defaults()?,
        };

        let version = tokio::time::timeout(config.command_timeout, docker.version())
            .await
            .map_err(|_| DockerConnectError::Timeout(config.command_timeout))??;

        info!(
            "DockerRuntime connected, engine version {}",
            version.version.as_deref().unwrap_or("unknown")
        );

        Ok(Self { config, docker })
    }

    /// Run one API request under the command timeout.
    async fn call<T, F>(&self, operation: &'static str, timeout: Duration, request: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, BollardError>>,
    {
        debug!("Docker request: {}", operation);
        tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| RuntimeError::Timeout { operation })?
            .map_err(|e| engine_error(operation, e))
    }
}

/// Map a bollard error onto the runtime taxonomy. 404 answers become `NotFound`.
fn engine_error(operation: &'static str, err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::not_found(operation, message),
        other => RuntimeError::engine(operation, other.to_string()),
    }
}

/// Split `"5432"` / `"5432/udp"` into the engine's port key.
fn port_key(container_port: &str) -> String {
    if container_port.contains('/') {
        container_port.to_string()
    } else {
        format!("{}/tcp", container_port)
    }
}

fn build_container_config(options: &CreateContainerOptions) -> Config<String> {
    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for (host_port, container_port) in &options.port_bindings {
        let key = port_key(container_port);
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(host_port.clone()),
            }]),
        );
    }

    let host_config = HostConfig {
        binds: (!options.volume_bindings.is_empty()).then(|| options.volume_bindings.clone()),
        port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
        ..Default::default()
    };

    Config {
        image: Some(options.image.clone()),
        env: (!options.env.is_empty()).then(|| options.env.clone()),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_network(&self, name: &str) -> Result<NetworkIdentity> {
        info!("DockerRuntime: Creating network {}", name);

        let options = CreateNetworkOptions {
            name: name.to_string(),
            check_duplicate: true,
            ..Default::default()
        };
        self.call(
            "network create",
            self.config.command_timeout,
            self.docker.create_network(options),
        )
        .await?;

        // Read the id back by name; the create answer differs between API versions.
        let network = self
            .call(
                "network inspect",
                self.config.command_timeout,
                self.docker
                    .inspect_network(name, None::<InspectNetworkOptions<String>>),
            )
            .await?;
        let id = network
            .id
            .ok_or_else(|| RuntimeError::engine("network inspect", "engine returned no id"))?;

        Ok(NetworkIdentity::new(id, name))
    }

    async fn pull_image(
        &self,
        image: &str,
        credentials: Option<&RegistryCredentials>,
    ) -> Result<ByteStream> {
        info!("DockerRuntime: Pulling image {}", image);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let credentials = credentials.map(|c| DockerCredentials {
            username: Some(c.username.clone()),
            password: Some(c.password.clone()),
            serveraddress: c.server_address.clone(),
            ..Default::default()
        });

        let stream = self
            .docker
            .create_image(Some(options), None, credentials)
            .map_ok(|info| {
                let mut line = info.status.unwrap_or_default();
                if let Some(progress) = info.progress {
                    line.push(' ');
                    line.push_str(&progress);
                }
                line.push('\n');
                line.into_bytes()
            })
            .map_err(|e| engine_error("image pull", e));

        Ok(stream.boxed())
    }

    async fn create_container(&self, options: &CreateContainerOptions) -> Result<ContainerId> {
        info!("DockerRuntime: Creating container from {}", options.image);

        let mut config = build_container_config(options);
        if let Some(network_id) = &options.network_id {
            let mut endpoints = HashMap::new();
            endpoints.insert(network_id.clone(), EndpointSettings::default());
            config.networking_config = Some(bollard::container::NetworkingConfig {
                endpoints_config: endpoints,
            });
        }

        let create_options = options.name.as_ref().map(|name| DockerCreateOptions {
            name: name.clone(),
            platform: None,
        });

        let response = self
            .call(
                "container create",
                self.config.command_timeout,
                self.docker.create_container(create_options, config),
            )
            .await?;

        debug!("Container {} created", response.id);
        Ok(response.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.call(
            "container start",
            self.config.command_timeout,
            self.docker
                .start_container(container_id, None::<StartContainerOptions<String>>),
        )
        .await?;

        debug!("Container {} started", container_id);
        Ok(())
    }

    async fn stop_container(&self, container_id: &str, timeout: Duration) -> Result<()> {
        info!("DockerRuntime: Stopping container {}", container_id);

        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        self.call(
            "container stop",
            self.config.command_timeout + timeout,
            self.docker.stop_container(container_id, Some(options)),
        )
        .await
    }

    async fn force_remove_container(&self, container_id: &str) -> Result<()> {
        info!("DockerRuntime: Removing container {}", container_id);

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.call(
            "container remove",
            self.config.command_timeout,
            self.docker.remove_container(container_id, Some(options)),
        )
        .await
    }

    async fn force_remove_image(&self, image: &str) -> Result<()> {
        info!("DockerRuntime: Removing image {}", image);

        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        self.call(
            "image remove",
            self.config.command_timeout,
            self.docker.remove_image(image, Some(options), None),
        )
        .await?;
        Ok(())
    }

    async fn remove_network(&self, network_id: &str) -> Result<()> {
        info!("DockerRuntime: Removing network {}", network_id);

        self.call(
            "network remove",
            self.config.command_timeout,
            self.docker.remove_network(network_id),
        )
        .await
    }

    async fn connect_to_network(&self, container_id: &str, network_id: &str) -> Result<()> {
        let options = ConnectNetworkOptions {
            container: container_id.to_string(),
            endpoint_config: EndpointSettings::default(),
        };
        self.call(
            "network connect",
            self.config.command_timeout,
            self.docker.connect_network(network_id, options),
        )
        .await
    }

    async fn inspect_ip_address(&self, container_id: &str, network_name: &str) -> Result<String> {
        let inspect = self
            .call(
                "container inspect",
                self.config.command_timeout,
                self.docker
                    .inspect_container(container_id, None::<InspectContainerOptions>),
            )
            .await?;

        inspect
            .network_settings
            .and_then(|settings| settings.networks)
            .and_then(|mut networks| networks.remove(network_name))
            .and_then(|endpoint| endpoint.ip_address)
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| {
                RuntimeError::engine(
                    "container inspect",
                    format!(
                        "container {} has no address in network {}",
                        container_id, network_name
                    ),
                )
            })
    }

    async fn stream_logs(&self, container_id: &str, since: i64) -> Result<ByteStream> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            since,
            ..Default::default()
        };

        let stream = self
            .docker
            .logs(container_id, Some(options))
            .map_ok(|output| output.into_bytes().to_vec())
            .map_err(|e| engine_error("container logs", e));

        Ok(stream.boxed())
    }
}
