//! The per-session environment: one private network plus the containers
//! launched into it.
//!
//! Teardown is single-shot. Whichever of an explicit [`TestEnvironment::cleanup`]
//! call or a signal-triggered cleanup gets there first performs it; every
//! later call returns immediately without engine calls.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use container_runtime_interface::{
    ContainerKind, ContainerRuntime, CreateContainerOptions, NetworkIdentity,
};
use serde::Serialize;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backup::{BackupManager, Manifest};
use crate::config::TestEnvConfig;
use crate::container::ContainerHandle;
use crate::env_vars::config_to_env_vars;
use crate::error::{ErrorList, Result, TestEnvError};
use crate::network::NetworkHandle;
use crate::options::{drain_into, RunOptions};
use crate::session::SessionContext;
use crate::shutdown::{process_exit, spawn_listener, ExitHook, OsSignals, SignalSource};

enum SignalMode {
    Os,
    Custom(Box<dyn SignalSource>),
    Disabled,
}

/// Builder for [`TestEnvironment`].
pub struct TestEnvironmentBuilder {
    session: SessionContext,
    runtime: Arc<dyn ContainerRuntime>,
    config: TestEnvConfig,
    signals: SignalMode,
    exit_hook: ExitHook,
}

impl TestEnvironmentBuilder {
    /// Use `config` for images, env prefixes, grace period and backup directory.
    pub fn config(mut self, config: TestEnvConfig) -> Self {
        self.config = config;
        self
    }

    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.config.grace_period_ms = grace.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    pub fn backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.backup_dir = dir.into();
        self
    }

    /// Listen to `source` instead of the process signals.
    pub fn signal_source(mut self, source: impl SignalSource) -> Self {
        self.signals = SignalMode::Custom(Box::new(source));
        self
    }

    pub fn without_signal_handler(mut self) -> Self {
        self.signals = SignalMode::Disabled;
        self
    }

    /// Called with the exit code after a signal-triggered cleanup. Defaults to
    /// terminating the process.
    pub fn exit_hook(mut self, hook: impl Fn(i32) + Send + Sync + 'static) -> Self {
        self.exit_hook = Arc::new(hook);
        self
    }

    /// Create the session network and start listening for signals.
    ///
    /// Fails without side effects if the network cannot be created.
    pub async fn build(self) -> Result<TestEnvironment> {
        let shutdown = CancellationToken::new();
        let signals: Option<Box<dyn SignalSource>> = match self.signals {
            SignalMode::Os => Some(Box::new(OsSignals::subscribe(shutdown.clone())?)),
            SignalMode::Custom(source) => Some(source),
            SignalMode::Disabled => None,
        };

        let network_name = self.session.network_name();
        info!("Environment: Creating network {}", network_name);
        let identity = self
            .runtime
            .create_network(&network_name)
            .await
            .map_err(|e| TestEnvError::runtime(format!("create network {}", network_name), e))?;

        let mut backup = BackupManager::new(&self.config.backup_dir, &self.session);
        if let Err(e) = backup.record_network(&identity.id).await {
            error!("Environment: Failed to write backup manifest: {}", e);
        }

        let grace = self.config.grace_period();
        let inner = Arc::new(EnvironmentInner {
            network: NetworkHandle::new(self.runtime.clone(), identity),
            session: self.session,
            runtime: self.runtime,
            config: self.config,
            basic: Mutex::new(Vec::new()),
            app: Mutex::new(Vec::new()),
            backup: Mutex::new(backup),
            closing: AtomicBool::new(false),
            teardown: OnceCell::new(),
            shutdown,
        });

        if let Some(signals) = signals {
            let weak = Arc::downgrade(&inner);
            spawn_listener(
                signals,
                inner.shutdown.clone(),
                grace,
                self.exit_hook,
                move || cleanup_from_signal(weak),
            );
        }

        Ok(TestEnvironment { inner })
    }
}

async fn cleanup_from_signal(inner: Weak<EnvironmentInner>) -> Result<()> {
    match inner.upgrade() {
        Some(inner) => TestEnvironment { inner }.cleanup().await,
        None => Ok(()),
    }
}

struct EnvironmentInner {
    session: SessionContext,
    runtime: Arc<dyn ContainerRuntime>,
    config: TestEnvConfig,
    network: NetworkHandle,
    basic: Mutex<Vec<Arc<ContainerHandle>>>,
    app: Mutex<Vec<Arc<ContainerHandle>>>,
    backup: Mutex<BackupManager>,
    /// Set when teardown starts; launches are rejected from then on.
    closing: AtomicBool,
    teardown: OnceCell<()>,
    shutdown: CancellationToken,
}

impl Drop for EnvironmentInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Resources of one test session. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TestEnvironment {
    inner: Arc<EnvironmentInner>,
}

impl TestEnvironment {
    pub fn builder(session: SessionContext, runtime: Arc<dyn ContainerRuntime>) -> TestEnvironmentBuilder {
        TestEnvironmentBuilder {
            session,
            runtime,
            config: TestEnvConfig::default(),
            signals: SignalMode::Os,
            exit_hook: process_exit(),
        }
    }

    /// Environment with default settings, listening to process signals.
    pub async fn new(session: SessionContext, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        Self::builder(session, runtime).build().await
    }

    pub fn session(&self) -> &SessionContext {
        &self.inner.session
    }

    pub fn config(&self) -> &TestEnvConfig {
        &self.inner.config
    }

    pub fn network(&self) -> &NetworkIdentity {
        self.inner.network.identity()
    }

    pub fn runtime(&self) -> Arc<dyn ContainerRuntime> {
        self.inner.runtime.clone()
    }

    pub fn backup_path(&self) -> PathBuf {
        self.inner.config.backup_dir.join(self.inner.session.backup_file_name())
    }

    pub fn backup_dir(&self) -> &Path {
        &self.inner.config.backup_dir
    }

    /// Snapshot of the in-memory backup manifest.
    pub async fn manifest(&self) -> Manifest {
        self.inner.backup.lock().await.manifest().clone()
    }

    pub async fn basic_containers(&self) -> Vec<Arc<ContainerHandle>> {
        self.inner.basic.lock().await.clone()
    }

    pub async fn app_containers(&self) -> Vec<Arc<ContainerHandle>> {
        self.inner.app.lock().await.clone()
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.inner.teardown.initialized()
    }

    // ==================== Launching ====================

    /// Launch a dependency container (database, broker, ...) into the session
    /// network. Returns its handle and in-network IP address.
    pub async fn run_dependency_container(
        &self,
        image: &str,
        options: RunOptions,
    ) -> Result<(Arc<ContainerHandle>, String)> {
        self.launch(ContainerKind::Basic, image, options, Vec::new()).await
    }

    /// Launch a container running the software under test. `local` and
    /// `remote` are encoded as environment variables under the configured
    /// prefixes.
    pub async fn run_application_container<L, R>(
        &self,
        image: &str,
        local: &L,
        remote: Option<&R>,
        options: RunOptions,
    ) -> Result<Arc<ContainerHandle>>
    where
        L: Serialize + ?Sized,
        R: Serialize + ?Sized,
    {
        let mut env = config_to_env_vars(local, &self.inner.config.env_prefix)?;
        if let Some(remote) = remote {
            env.extend(config_to_env_vars(remote, &self.inner.config.remote_env_prefix)?);
        }
        let (handle, _) = self.launch(ContainerKind::App, image, options, env).await?;
        Ok(handle)
    }

    async fn launch(
        &self,
        kind: ContainerKind,
        image: &str,
        options: RunOptions,
        mut env: Vec<String>,
    ) -> Result<(Arc<ContainerHandle>, String)> {
        self.ensure_open()?;
        let runtime = &self.inner.runtime;

        let mut image_id = String::new();
        if options.pull {
            info!("Environment: Pulling image {}", image);
            let context = || format!("pull image {}", image);
            let progress = runtime
                .pull_image(image, options.credentials.as_ref())
                .await
                .map_err(|e| TestEnvError::runtime(context(), e))?;
            drain_into(progress, options.log_sink.as_ref())
                .await
                .map_err(|e| TestEnvError::runtime(context(), e))?;
            image_id = image.to_string();
        }

        env.extend(options.env_entries());
        let create = CreateContainerOptions {
            image: image.to_string(),
            env,
            port_bindings: options.port_bindings.clone(),
            volume_bindings: options.volume_entries(),
            network_id: None,
            name: options.name.clone(),
        };
        let container_id = match runtime.create_container(&create).await {
            Ok(id) => id,
            Err(e) => {
                if kind == ContainerKind::App && !image_id.is_empty() {
                    self.discard_image(&image_id).await;
                }
                return Err(TestEnvError::runtime(format!("create container from {}", image), e));
            }
        };
        info!("Environment: Created {} container {} from {}", kind, container_id, image);

        let handle = Arc::new(ContainerHandle::new(
            runtime.clone(),
            kind,
            container_id.clone(),
            image_id.clone(),
            options.log_sink.clone(),
        ));
        if let Err(e) = self.track(kind, &handle, &container_id, &image_id).await {
            warn!("Environment: Cleanup started while {} was being created", container_id);
            Self::discard(kind, &handle).await;
            return Err(e);
        }

        match self.attach_and_start(&handle, &container_id).await {
            Ok(ip_address) => Ok((handle, ip_address)),
            Err(e) => {
                warn!("Environment: Container {} failed to come up: {}", container_id, e);
                Self::discard(kind, &handle).await;
                Err(e)
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closing.load(Ordering::SeqCst) {
            return Err(TestEnvError::InvalidState(
                "environment is being or has been cleaned up".to_string(),
            ));
        }
        Ok(())
    }

    /// Remove a container that never made it into service. App containers
    /// take their pulled image with them.
    async fn discard(kind: ContainerKind, handle: &ContainerHandle) {
        let discarded = match kind {
            ContainerKind::App => handle.close().await,
            ContainerKind::Basic => handle.force_remove_container().await,
        };
        if let Err(e) = discarded {
            warn!("Environment: Leaving {} for cleanup: {}", handle.id().await, e);
        }
    }

    async fn discard_image(&self, image_id: &str) {
        match self.inner.runtime.force_remove_image(image_id).await {
            Ok(()) => debug!("Environment: Removed image {} after failed create", image_id),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!("Environment: Failed to remove image {}: {}", image_id, e),
        }
    }

    /// Records a created container. The closing check happens under the list
    /// lock, so teardown either sees the container or the launch is refused.
    async fn track(
        &self,
        kind: ContainerKind,
        handle: &Arc<ContainerHandle>,
        container_id: &str,
        image_id: &str,
    ) -> Result<()> {
        let list = match kind {
            ContainerKind::Basic => &self.inner.basic,
            ContainerKind::App => &self.inner.app,
        };
        {
            let mut list = list.lock().await;
            self.ensure_open()?;
            list.push(handle.clone());
        }

        let mut backup = self.inner.backup.lock().await;
        if let Err(e) = backup.record_container(kind, container_id, image_id).await {
            error!("Environment: Failed to write backup manifest: {}", e);
        }
        Ok(())
    }

    async fn attach_and_start(&self, handle: &ContainerHandle, container_id: &str) -> Result<String> {
        let network = self.inner.network.identity();
        self.inner
            .runtime
            .connect_to_network(container_id, &network.id)
            .await
            .map_err(|e| {
                TestEnvError::runtime(
                    format!("connect container {} to network {}", container_id, network.name),
                    e,
                )
            })?;

        handle.start().await?;

        let ip_address = self
            .inner
            .runtime
            .inspect_ip_address(container_id, &network.name)
            .await
            .map_err(|e| TestEnvError::runtime(format!("inspect address of container {}", container_id), e))?;
        debug!("Environment: Container {} is at {}", container_id, ip_address);
        handle.set_ip_address(ip_address.clone()).await;
        Ok(ip_address)
    }

    // ==================== Teardown ====================

    /// Remove everything this session created: app containers (with their
    /// pulled images) newest first, then dependency containers newest first,
    /// then the network. Every step is attempted; failures come back as one
    /// combined error.
    ///
    /// Only the first call does any work. Concurrent callers wait for it and
    /// then return `Ok(())`.
    pub async fn cleanup(&self) -> Result<()> {
        let mut outcome = None;
        let slot = &mut outcome;
        self.inner
            .teardown
            .get_or_init(|| async move {
                *slot = Some(self.inner.teardown().await);
            })
            .await;
        outcome.unwrap_or(Ok(()))
    }
}

impl EnvironmentInner {
    async fn teardown(&self) -> Result<()> {
        info!("Environment: Cleaning up session {}", self.session.build_name());
        self.closing.store(true, Ordering::SeqCst);
        let mut errors = ErrorList::new();

        let apps = self.app.lock().await.clone();
        for handle in apps.iter().rev() {
            if let Err(e) = handle.close().await {
                warn!("Environment: {}", e);
                errors.push(e);
            }
        }

        let basics = self.basic.lock().await.clone();
        for handle in basics.iter().rev() {
            if let Err(e) = handle.force_remove_container().await {
                warn!("Environment: {}", e);
                errors.push(e);
            }
        }

        if let Err(e) = self.network.close().await {
            warn!("Environment: {}", e);
            errors.push(e);
        }

        // Teardown is single-shot, so a later signal has nothing left to do
        // here and gets the default action instead.
        self.shutdown.cancel();
        if errors.is_empty() {
            if let Err(e) = self.backup.lock().await.remove_file().await {
                warn!("Environment: Failed to remove backup manifest: {}", e);
            }
            info!("Environment: Session {} cleaned up", self.session.build_name());
        } else {
            error!(
                "Environment: Cleanup of session {} left {} failure(s); resources stay in the backup manifest",
                self.session.build_name(),
                errors.len()
            );
        }
        errors.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use container_runtime::mock::{ops, MockRuntime};

    async fn environment(runtime: &MockRuntime, dir: &Path) -> TestEnvironment {
        TestEnvironment::builder(SessionContext::with_token("unit", "1"), Arc::new(runtime.clone()))
            .backup_dir(dir)
            .without_signal_handler()
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_network_failure_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = MockRuntime::new();
        runtime.fail_on(ops::CREATE_NETWORK, container_runtime::mock::ANY_TARGET);

        let result = TestEnvironment::builder(SessionContext::with_token("unit", "1"), Arc::new(runtime.clone()))
            .backup_dir(dir.path())
            .without_signal_handler()
            .build()
            .await;
        assert!(matches!(result, Err(TestEnvError::Runtime { .. })));
        assert_eq!(runtime.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_dependency_container_joins_network() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = MockRuntime::new();
        let env = environment(&runtime, dir.path()).await;

        let (handle, ip) = env
            .run_dependency_container("postgres:alpine", RunOptions::new().name("db"))
            .await
            .unwrap();

        assert!(ip.starts_with("172.28.0."));
        assert_eq!(handle.ip_address().await, ip);
        let id = handle.id().await;
        assert!(runtime.is_running(&id));
        assert_eq!(runtime.container_name(&id).as_deref(), Some("db"));
        assert_eq!(runtime.calls_for(ops::PULL_IMAGE).len(), 0);
    }

    #[tokio::test]
    async fn test_failed_start_discards_container() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = MockRuntime::new();
        runtime.fail_on(ops::START_CONTAINER, container_runtime::mock::ANY_TARGET);
        let env = environment(&runtime, dir.path()).await;

        let err = env
            .run_dependency_container("redis", RunOptions::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("start container"));
        assert_eq!(runtime.container_count(), 0);
        // Still tracked so the manifest reflects what was created.
        assert_eq!(env.manifest().await.basic_containers.len(), 1);
    }

    #[tokio::test]
    async fn test_launch_after_cleanup_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = MockRuntime::new();
        let env = environment(&runtime, dir.path()).await;

        env.cleanup().await.unwrap();
        assert!(env.is_cleaned_up());
        assert!(matches!(
            env.run_dependency_container("redis", RunOptions::new()).await,
            Err(TestEnvError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_create_removes_pulled_app_image() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = MockRuntime::new();
        runtime.fail_on(ops::CREATE_CONTAINER, container_runtime::mock::ANY_TARGET);
        let env = environment(&runtime, dir.path()).await;

        let err = env
            .run_application_container("app:1", &(), None::<&()>, RunOptions::new().pull_image())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("create container from app:1"));
        assert!(!runtime.image_exists("app:1"));
        assert_eq!(runtime.calls_for(ops::REMOVE_IMAGE), vec!["remove_image:app:1".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_create_keeps_pulled_dependency_image() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = MockRuntime::new();
        runtime.fail_on(ops::CREATE_CONTAINER, container_runtime::mock::ANY_TARGET);
        let env = environment(&runtime, dir.path()).await;

        env.run_dependency_container("postgres:alpine", RunOptions::new().pull_image())
            .await
            .unwrap_err();
        assert!(runtime.image_exists("postgres:alpine"));
        assert!(runtime.calls_for(ops::REMOVE_IMAGE).is_empty());
    }

    #[tokio::test]
    async fn test_launch_during_cleanup_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = MockRuntime::new();
        runtime.set_latency(ops::REMOVE_NETWORK, Duration::from_millis(200));
        let env = environment(&runtime, dir.path()).await;

        let cleanup = tokio::spawn({
            let env = env.clone();
            async move { env.cleanup().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!env.is_cleaned_up());

        assert!(matches!(
            env.run_dependency_container("redis", RunOptions::new()).await,
            Err(TestEnvError::InvalidState(_))
        ));
        cleanup.await.unwrap().unwrap();
        assert!(runtime.calls_for(ops::CREATE_CONTAINER).is_empty());
    }

    #[tokio::test]
    async fn test_container_created_while_cleanup_starts_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = MockRuntime::new();
        runtime.set_latency(ops::CREATE_CONTAINER, Duration::from_millis(100));
        let env = environment(&runtime, dir.path()).await;

        let launch = tokio::spawn({
            let env = env.clone();
            async move { env.run_dependency_container("redis", RunOptions::new()).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        env.cleanup().await.unwrap();

        assert!(matches!(launch.await.unwrap(), Err(TestEnvError::InvalidState(_))));
        assert_eq!(runtime.calls_for(ops::CREATE_CONTAINER).len(), 1);
        assert_eq!(runtime.container_count(), 0);
        assert!(env.basic_containers().await.is_empty());
    }

    #[tokio::test]
    async fn test_application_env_is_encoded() {
        #[derive(Serialize)]
        struct Local {
            port: u16,
            name: String,
        }

        let dir = tempfile::tempdir().unwrap();
        let runtime = MockRuntime::new();
        let env = environment(&runtime, dir.path()).await;

        let handle = env
            .run_application_container(
                "app:1",
                &Local {
                    port: 8080,
                    name: String::new(),
                },
                Some(&serde_json::json!({"database": {"host": "db"}})),
                RunOptions::new().pull_image(),
            )
            .await
            .unwrap();

        assert_eq!(handle.image_id().await, "app:1");
        assert_eq!(env.manifest().await.app_containers[&handle.id().await], "app:1");
    }
}
