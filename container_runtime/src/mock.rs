//! In-memory container runtime for tests.
//!
//! `MockRuntime` keeps containers, networks and images in memory and records
//! every call as `"<operation>:<target>"` in the order it was made. Failures
//! and latency can be injected per operation and target.
//!
//! It enforces the engine rules the lifecycle code depends on: removing an
//! absent resource fails with `NotFound`, and a network with attached
//! containers cannot be removed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tracing::debug;

use container_runtime_interface::{
    ByteStream, ContainerId, ContainerRuntime, CreateContainerOptions, NetworkIdentity,
    RegistryCredentials,
};
use testenv_shared_types::{Result, RuntimeError};

/// Operation names used in the call log and for failure injection.
pub mod ops {
    pub const CREATE_NETWORK: &str = "create_network";
    pub const PULL_IMAGE: &str = "pull_image";
    pub const CREATE_CONTAINER: &str = "create_container";
    pub const START_CONTAINER: &str = "start_container";
    pub const STOP_CONTAINER: &str = "stop_container";
    pub const REMOVE_CONTAINER: &str = "remove_container";
    pub const REMOVE_IMAGE: &str = "remove_image";
    pub const REMOVE_NETWORK: &str = "remove_network";
    pub const CONNECT_NETWORK: &str = "connect_network";
    pub const INSPECT_IP: &str = "inspect_ip";
    pub const STREAM_LOGS: &str = "stream_logs";
}

/// Matches any target when used with [`MockRuntime::fail_on`].
pub const ANY_TARGET: &str = "*";

#[derive(Debug, Clone)]
struct MockContainer {
    image: String,
    name: Option<String>,
    running: bool,
    /// network id -> ip address
    networks: HashMap<String, String>,
}

#[derive(Default)]
struct MockState {
    calls: Vec<String>,
    containers: HashMap<String, MockContainer>,
    /// network id -> name
    networks: HashMap<String, String>,
    images: HashSet<String>,
    failures: HashSet<(String, String)>,
    latency: HashMap<String, Duration>,
    logs: Vec<Vec<u8>>,
}

/// In-memory [`ContainerRuntime`].
#[derive(Clone, Default)]
pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
    next_id: Arc<AtomicUsize>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the calls recorded so far.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{}", prefix, n)
    }

    /// Record the call, apply latency and injected failures.
    async fn enter(&self, operation: &'static str, target: &str) -> Result<()> {
        let delay = {
            let mut state = self.lock();
            state.calls.push(format!("{}:{}", operation, target));
            state.latency.get(operation).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.lock();
        let fails = state
            .failures
            .contains(&(operation.to_string(), target.to_string()))
            || state
                .failures
                .contains(&(operation.to_string(), ANY_TARGET.to_string()));
        if fails {
            debug!("MockRuntime: injected failure for {}:{}", operation, target);
            return Err(RuntimeError::engine(operation, format!("injected failure for {}", target)));
        }
        Ok(())
    }

    // ==================== Test Controls ====================

    /// Make every `operation` on `target` fail until cleared. Use [`ANY_TARGET`] to
    /// fail the operation regardless of target.
    pub fn fail_on(&self, operation: &str, target: &str) {
        self.lock()
            .failures
            .insert((operation.to_string(), target.to_string()));
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Delay every call of `operation` by `delay`.
    pub fn set_latency(&self, operation: &str, delay: Duration) {
        self.lock().latency.insert(operation.to_string(), delay);
    }

    /// Chunks returned by `stream_logs`.
    pub fn set_logs(&self, chunks: Vec<Vec<u8>>) {
        self.lock().logs = chunks;
    }

    /// Seed a container, as if left behind by an earlier process.
    pub fn insert_container(&self, container_id: &str, image: &str) {
        self.lock().containers.insert(
            container_id.to_string(),
            MockContainer {
                image: image.to_string(),
                name: None,
                running: true,
                networks: HashMap::new(),
            },
        );
    }

    pub fn insert_network(&self, network_id: &str, name: &str) {
        self.lock()
            .networks
            .insert(network_id.to_string(), name.to_string());
    }

    pub fn insert_image(&self, image: &str) {
        self.lock().images.insert(image.to_string());
    }

    // ==================== Inspection ====================

    /// All calls in the order they were made.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Calls of one operation, in order.
    pub fn calls_for(&self, operation: &str) -> Vec<String> {
        let prefix = format!("{}:", operation);
        self.lock()
            .calls
            .iter()
            .filter(|call| call.starts_with(&prefix))
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn container_exists(&self, container_id: &str) -> bool {
        self.lock().containers.contains_key(container_id)
    }

    pub fn is_running(&self, container_id: &str) -> bool {
        self.lock()
            .containers
            .get(container_id)
            .map(|c| c.running)
            .unwrap_or(false)
    }

    pub fn container_name(&self, container_id: &str) -> Option<String> {
        self.lock()
            .containers
            .get(container_id)
            .and_then(|c| c.name.clone())
    }

    pub fn container_image(&self, container_id: &str) -> Option<String> {
        self.lock()
            .containers
            .get(container_id)
            .map(|c| c.image.clone())
    }

    pub fn network_exists(&self, network_id: &str) -> bool {
        self.lock().networks.contains_key(network_id)
    }

    pub fn image_exists(&self, image: &str) -> bool {
        self.lock().images.contains(image)
    }

    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create_network(&self, name: &str) -> Result<NetworkIdentity> {
        self.enter(ops::CREATE_NETWORK, name).await?;

        let id = self.next_id("network");
        self.lock().networks.insert(id.clone(), name.to_string());
        Ok(NetworkIdentity::new(id, name))
    }

    async fn pull_image(
        &self,
        image: &str,
        _credentials: Option<&RegistryCredentials>,
    ) -> Result<ByteStream> {
        self.enter(ops::PULL_IMAGE, image).await?;

        self.lock().images.insert(image.to_string());
        let lines = vec![
            Ok(format!("Pulling from {}\n", image).into_bytes()),
            Ok(format!("Status: Downloaded newer image for {}\n", image).into_bytes()),
        ];
        Ok(stream::iter(lines).boxed())
    }

    async fn create_container(&self, options: &CreateContainerOptions) -> Result<ContainerId> {
        self.enter(ops::CREATE_CONTAINER, &options.image).await?;

        let id = self.next_id("container");
        let mut state = self.lock();
        let mut networks = HashMap::new();
        if let Some(network_id) = &options.network_id {
            if !state.networks.contains_key(network_id) {
                return Err(RuntimeError::not_found("network", network_id.clone()));
            }
            networks.insert(network_id.clone(), String::new());
        }
        state.containers.insert(
            id.clone(),
            MockContainer {
                image: options.image.clone(),
                name: options.name.clone(),
                running: false,
                networks,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.enter(ops::START_CONTAINER, container_id).await?;

        let mut state = self.lock();
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::not_found("container", container_id))?;
        container.running = true;
        Ok(())
    }

    async fn stop_container(&self, container_id: &str, _timeout: Duration) -> Result<()> {
        self.enter(ops::STOP_CONTAINER, container_id).await?;

        let mut state = self.lock();
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::not_found("container", container_id))?;
        container.running = false;
        Ok(())
    }

    async fn force_remove_container(&self, container_id: &str) -> Result<()> {
        self.enter(ops::REMOVE_CONTAINER, container_id).await?;

        self.lock()
            .containers
            .remove(container_id)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::not_found("container", container_id))
    }

    async fn force_remove_image(&self, image: &str) -> Result<()> {
        self.enter(ops::REMOVE_IMAGE, image).await?;

        if self.lock().images.remove(image) {
            Ok(())
        } else {
            Err(RuntimeError::not_found("image", image))
        }
    }

    async fn remove_network(&self, network_id: &str) -> Result<()> {
        self.enter(ops::REMOVE_NETWORK, network_id).await?;

        let mut state = self.lock();
        if !state.networks.contains_key(network_id) {
            return Err(RuntimeError::not_found("network", network_id));
        }
        let attached = state
            .containers
            .values()
            .filter(|c| c.networks.contains_key(network_id))
            .count();
        if attached > 0 {
            return Err(RuntimeError::engine(
                ops::REMOVE_NETWORK,
                format!("network {} has {} active endpoints", network_id, attached),
            ));
        }
        state.networks.remove(network_id);
        Ok(())
    }

    async fn connect_to_network(&self, container_id: &str, network_id: &str) -> Result<()> {
        self.enter(ops::CONNECT_NETWORK, container_id).await?;

        let ip_suffix = self.next_id.fetch_add(1, Ordering::SeqCst) % 250 + 2;
        let mut state = self.lock();
        if !state.networks.contains_key(network_id) {
            return Err(RuntimeError::not_found("network", network_id));
        }
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::not_found("container", container_id))?;
        container
            .networks
            .insert(network_id.to_string(), format!("172.28.0.{}", ip_suffix));
        Ok(())
    }

    async fn inspect_ip_address(&self, container_id: &str, network_name: &str) -> Result<String> {
        self.enter(ops::INSPECT_IP, container_id).await?;

        let state = self.lock();
        let container = state
            .containers
            .get(container_id)
            .ok_or_else(|| RuntimeError::not_found("container", container_id))?;
        container
            .networks
            .iter()
            .find(|(id, ip)| {
                !ip.is_empty()
                    && state.networks.get(*id).map(String::as_str) == Some(network_name)
            })
            .map(|(_, ip)| ip.clone())
            .ok_or_else(|| {
                RuntimeError::engine(
                    ops::INSPECT_IP,
                    format!("{} has no address in {}", container_id, network_name),
                )
            })
    }

    async fn stream_logs(&self, container_id: &str, _since: i64) -> Result<ByteStream> {
        self.enter(ops::STREAM_LOGS, container_id).await?;

        let chunks: Vec<Result<Vec<u8>>> = self.lock().logs.iter().cloned().map(Ok).collect();
        Ok(stream::iter(chunks).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_container_lifecycle_is_recorded() {
        let runtime = MockRuntime::new();
        let net = runtime.create_network("net").await.unwrap();
        let id = runtime
            .create_container(&CreateContainerOptions::new("alpine"))
            .await
            .unwrap();
        runtime.connect_to_network(&id, &net.id).await.unwrap();
        runtime.start_container(&id).await.unwrap();
        assert!(runtime.is_running(&id));

        let ip = runtime.inspect_ip_address(&id, "net").await.unwrap();
        assert!(ip.starts_with("172.28.0."));

        runtime.force_remove_container(&id).await.unwrap();
        runtime.remove_network(&net.id).await.unwrap();

        assert_eq!(
            runtime.calls(),
            vec![
                "create_network:net".to_string(),
                "create_container:alpine".to_string(),
                format!("connect_network:{}", id),
                format!("start_container:{}", id),
                format!("inspect_ip:{}", id),
                format!("remove_container:{}", id),
                format!("remove_network:{}", net.id),
            ]
        );
    }

    #[tokio::test]
    async fn test_remove_absent_container_is_not_found() {
        let runtime = MockRuntime::new();
        let err = runtime.force_remove_container("ghost").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_network_with_endpoints_cannot_be_removed() {
        let runtime = MockRuntime::new();
        let net = runtime.create_network("net").await.unwrap();
        let id = runtime
            .create_container(&CreateContainerOptions::new("alpine"))
            .await
            .unwrap();
        runtime.connect_to_network(&id, &net.id).await.unwrap();

        assert!(runtime.remove_network(&net.id).await.is_err());
        assert!(runtime.network_exists(&net.id));
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let runtime = MockRuntime::new();
        runtime.insert_container("c-1", "alpine");
        runtime.fail_on(ops::REMOVE_CONTAINER, "c-1");

        assert!(runtime.force_remove_container("c-1").await.is_err());
        assert!(runtime.container_exists("c-1"));

        runtime.clear_failures();
        runtime.force_remove_container("c-1").await.unwrap();
        assert!(!runtime.container_exists("c-1"));
    }

    #[tokio::test]
    async fn test_pull_marks_image_present() {
        let runtime = MockRuntime::new();
        let stream = runtime.pull_image("postgres:alpine", None).await.unwrap();
        let chunks: Vec<_> = stream.collect().await;
        assert_eq!(chunks.len(), 2);
        assert!(runtime.image_exists("postgres:alpine"));
    }
}
