//! Handle to one launched container.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use container_runtime_interface::{ContainerKind, ContainerRuntime, RuntimeError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ErrorList, Result, TestEnvError};
use crate::options::{drain_into, LogSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerLifecycle {
    Created,
    Started,
    Stopped,
    Removed,
}

#[derive(Debug)]
struct ContainerState {
    container_id: String,
    image_id: String,
    lifecycle: ContainerLifecycle,
    ip_address: String,
}

/// A container created by the test environment.
///
/// Removal is idempotent: once the container (or its pulled image) is gone
/// the corresponding id is cleared and later calls do nothing.
pub struct ContainerHandle {
    runtime: Arc<dyn ContainerRuntime>,
    kind: ContainerKind,
    log_sink: Option<LogSink>,
    state: Mutex<ContainerState>,
}

impl std::fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl ContainerHandle {
    /// `image_id` is empty unless the image was pulled for this container.
    pub(crate) fn new(
        runtime: Arc<dyn ContainerRuntime>,
        kind: ContainerKind,
        container_id: String,
        image_id: String,
        log_sink: Option<LogSink>,
    ) -> Self {
        Self {
            runtime,
            kind,
            log_sink,
            state: Mutex::new(ContainerState {
                container_id,
                image_id,
                lifecycle: ContainerLifecycle::Created,
                ip_address: String::new(),
            }),
        }
    }

    pub fn kind(&self) -> ContainerKind {
        self.kind
    }

    /// Empty once the container has been removed.
    pub async fn id(&self) -> String {
        self.state.lock().await.container_id.clone()
    }

    /// Empty when the image was not pulled by us or has been removed.
    pub async fn image_id(&self) -> String {
        self.state.lock().await.image_id.clone()
    }

    pub async fn lifecycle(&self) -> ContainerLifecycle {
        self.state.lock().await.lifecycle
    }

    pub async fn ip_address(&self) -> String {
        self.state.lock().await.ip_address.clone()
    }

    pub(crate) async fn set_ip_address(&self, ip_address: String) {
        self.state.lock().await.ip_address = ip_address;
    }

    /// Start the container. When a log sink is configured, container output
    /// from this point on is copied into it in the background.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.lifecycle {
            ContainerLifecycle::Started => return Ok(()),
            ContainerLifecycle::Removed => {
                return Err(TestEnvError::InvalidState(
                    "cannot start a removed container".to_string(),
                ))
            }
            ContainerLifecycle::Created | ContainerLifecycle::Stopped => {}
        }

        let container_id = state.container_id.clone();
        let since = Utc::now().timestamp();
        self.runtime
            .start_container(&container_id)
            .await
            .map_err(|e| TestEnvError::runtime(format!("start container {}", container_id), e))?;
        state.lifecycle = ContainerLifecycle::Started;
        drop(state);

        if let Some(sink) = self.log_sink.clone() {
            self.follow_logs(container_id, since, sink);
        }
        Ok(())
    }

    fn follow_logs(&self, container_id: String, since: i64, sink: LogSink) {
        let runtime = self.runtime.clone();
        tokio::spawn(async move {
            let result = match runtime.stream_logs(&container_id, since).await {
                Ok(stream) => drain_into(stream, Some(&sink)).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => debug!("Log stream for container {} ended", container_id),
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("Log stream for container {} failed: {}", container_id, e),
            }
        });
    }

    /// Stop a started container. Does nothing in any other state.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.lifecycle != ContainerLifecycle::Started {
            return Ok(());
        }

        let container_id = state.container_id.clone();
        info!("Container: Stopping {} (timeout {:?})", container_id, timeout);
        let result = self.runtime.stop_container(&container_id, timeout).await;
        state.lifecycle = ContainerLifecycle::Stopped;
        result.map_err(|e| TestEnvError::runtime(format!("stop container {}", container_id), e))
    }

    /// Remove the container even if it is running. A container the engine no
    /// longer knows about counts as removed.
    pub async fn force_remove_container(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.container_id.is_empty() {
            return Ok(());
        }

        let container_id = state.container_id.clone();
        info!("Container: Removing {} ({})", container_id, self.kind);
        match self.runtime.force_remove_container(&container_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!("Container {} was already gone", container_id);
            }
            Err(e) => {
                return Err(TestEnvError::runtime(
                    format!("remove container {}", container_id),
                    e,
                ))
            }
        }
        state.container_id.clear();
        state.lifecycle = ContainerLifecycle::Removed;
        Ok(())
    }

    /// Remove the image pulled for this container, if any.
    pub async fn force_remove_image(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.image_id.is_empty() {
            return Ok(());
        }

        let image_id = state.image_id.clone();
        info!("Container: Removing image {}", image_id);
        match self.runtime.force_remove_image(&image_id).await {
            Ok(()) => {}
            Err(RuntimeError::NotFound { .. }) => {
                debug!("Image {} was already gone", image_id);
            }
            Err(e) => return Err(TestEnvError::runtime(format!("remove image {}", image_id), e)),
        }
        state.image_id.clear();
        Ok(())
    }

    /// Remove the container, then its pulled image. The image is attempted
    /// even when the container removal fails; both failures are reported.
    pub async fn close(&self) -> Result<()> {
        let mut errors = ErrorList::new();
        errors.push_result(self.force_remove_container().await);
        errors.push_result(self.force_remove_image().await);
        errors.into_result()
    }
}
