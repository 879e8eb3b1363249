//! Ephemeral container topologies for integration tests.
//!
//! A [`TestEnvironment`] owns one private network per test session and the
//! containers launched into it: dependency containers (databases, brokers)
//! and application containers running the software under test. Everything it
//! creates is recorded in an on-disk backup manifest, so resources left behind
//! by a crashed run can be reclaimed later with [`sweep_orphans`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use test_environment::{await_tcp, IntegrationTestRunner, RunOptions, TestEnvConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = TestEnvConfig::load("conf")?;
//! IntegrationTestRunner::with_docker(config)
//!     .await?
//!     .run(|env| async move {
//!         let (_pg, db) = env.run_postgres(RunOptions::new()).await?;
//!         await_tcp(&format!("{}:{}", db.address, db.port), Duration::from_secs(30)).await?;
//!         Ok(())
//!     })
//!     .await
//! # }
//! ```

pub mod backup;
pub mod config;
pub mod container;
pub mod env_vars;
pub mod environment;
pub mod error;
pub mod network;
pub mod options;
pub mod retry;
pub mod runner;
pub mod services;
pub mod session;
pub mod shutdown;

pub use backup::{list_manifests, sweep_orphans, BackupManager, Manifest, SweepReport};
pub use config::{ImageConfig, RegistryConfig, TestEnvConfig, CONFIG_FILE_NAME};
pub use container::{ContainerHandle, ContainerLifecycle};
pub use env_vars::config_to_env_vars;
pub use environment::{TestEnvironment, TestEnvironmentBuilder};
pub use error::{ErrorList, Result, TestEnvError};
pub use network::NetworkHandle;
pub use options::{log_sink, LogSink, RunOptions};
pub use retry::{await_connection, await_tcp, DeadlineExceeded, Retryer, DEFAULT_ATTEMPT_INTERVAL};
pub use runner::IntegrationTestRunner;
pub use services::{
    AddressConfiguration, ConfigServiceConfiguration, DbConfiguration, ElasticConfiguration,
    ModuleConfiguration, RabbitConfiguration,
};
pub use session::{SessionContext, BACKUP_FILE_PREFIX};
pub use shutdown::{process_exit, race_cleanup, ExitHook, OsSignals, ShutdownOutcome, SignalSource};

pub use container_runtime_interface::{ContainerKind, ContainerRuntime, RegistryCredentials, RuntimeError};
