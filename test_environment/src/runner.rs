//! Drives one integration-test session from setup to teardown.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use container_runtime_interface::ContainerRuntime;
use tracing::{error, info, warn};

use crate::backup::sweep_orphans;
use crate::config::TestEnvConfig;
use crate::environment::{TestEnvironment, TestEnvironmentBuilder};
use crate::session::SessionContext;

type Customize = Box<dyn FnOnce(TestEnvironmentBuilder) -> TestEnvironmentBuilder + Send>;

pub struct IntegrationTestRunner {
    config: TestEnvConfig,
    runtime: Arc<dyn ContainerRuntime>,
    customize: Option<Customize>,
}

impl IntegrationTestRunner {
    pub fn new(config: TestEnvConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            config,
            runtime,
            customize: None,
        }
    }

    /// Runner backed by the local Docker daemon.
    #[cfg(feature = "docker-runtime")]
    pub async fn with_docker(config: TestEnvConfig) -> anyhow::Result<Self> {
        let runtime = container_runtime::DockerRuntime::new()
            .await
            .context("connect to Docker")?;
        Ok(Self::new(config, Arc::new(runtime)))
    }

    /// Adjust the environment builder before the session starts, e.g. to
    /// replace the signal source.
    pub fn customize(
        mut self,
        customize: impl FnOnce(TestEnvironmentBuilder) -> TestEnvironmentBuilder + Send + 'static,
    ) -> Self {
        self.customize = Some(Box::new(customize));
        self
    }

    pub fn config(&self) -> &TestEnvConfig {
        &self.config
    }

    /// Set up a session, run `test` against it and tear everything down.
    ///
    /// Cleanup runs whether or not the test succeeds. If both fail, the test
    /// error is returned and the cleanup error is logged.
    pub async fn run<F, Fut>(self, test: F) -> anyhow::Result<()>
    where
        F: FnOnce(TestEnvironment) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        if let Err(e) = observability::init_tracing(&self.config.tracing) {
            eprintln!("Failed to initialise tracing: {}", e);
        }
        self.config.validate()?;

        if self.config.cleanup_on_start {
            info!("Runner: Sweeping leftovers from previous sessions");
            match sweep_orphans(self.runtime.as_ref(), &self.config.backup_dir, None).await {
                Ok(report) => info!(
                    "Runner: Swept {} manifest(s), {} container(s), {} network(s)",
                    report.files_swept, report.containers_removed, report.networks_removed
                ),
                Err(e) => warn!("Runner: Sweep of previous sessions failed: {}", e),
            }
        }

        if self.config.skip {
            info!("Runner: Skipping integration tests");
            return Ok(());
        }

        let session = SessionContext::new(&self.config.module_name);
        info!("Runner: Starting session {}", session.build_name());
        let mut builder = TestEnvironment::builder(session, self.runtime).config(self.config);
        if let Some(customize) = self.customize {
            builder = customize(builder);
        }
        let environment = builder.build().await.context("create test environment")?;

        let outcome = test(environment.clone()).await;
        let cleanup = environment.cleanup().await;

        match (outcome, cleanup) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(e)) => Err(anyhow::Error::new(e).context("clean up test environment")),
            (Err(test_err), Ok(())) => Err(test_err),
            (Err(test_err), Err(cleanup_err)) => {
                error!("Runner: Cleanup after failed test also failed: {}", cleanup_err);
                Err(test_err)
            }
        }
    }
}
