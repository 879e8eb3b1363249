use std::sync::Arc;

use container_runtime_interface::{ContainerRuntime, NetworkIdentity};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, TestEnvError};

/// The session's private bridge network.
pub struct NetworkHandle {
    runtime: Arc<dyn ContainerRuntime>,
    identity: NetworkIdentity,
    removed: Mutex<bool>,
}

impl NetworkHandle {
    pub(crate) fn new(runtime: Arc<dyn ContainerRuntime>, identity: NetworkIdentity) -> Self {
        Self {
            runtime,
            identity,
            removed: Mutex::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn identity(&self) -> &NetworkIdentity {
        &self.identity
    }

    pub async fn is_removed(&self) -> bool {
        *self.removed.lock().await
    }

    /// Remove the network. Later calls do nothing once removal succeeded.
    pub async fn close(&self) -> Result<()> {
        let mut removed = self.removed.lock().await;
        if *removed || self.identity.id.is_empty() {
            return Ok(());
        }

        info!("Network: Removing {} ({})", self.identity.name, self.identity.id);
        match self.runtime.remove_network(&self.identity.id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("Network {} was already gone", self.identity.id),
            Err(e) => {
                return Err(TestEnvError::runtime(
                    format!("remove network {}", self.identity.id),
                    e,
                ))
            }
        }
        *removed = true;
        Ok(())
    }
}
