//! Test session configuration.
//!
//! Loaded from `config_test.toml` with `TESTENV_*` environment variables
//! applied on top. Registry credentials are redacted in Debug output.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use container_runtime_interface::RegistryCredentials;
use observability::TracingConfig;
use serde::Deserialize;

use crate::error::{Result, TestEnvError};

/// File looked up by [`TestEnvConfig::load`].
pub const CONFIG_FILE_NAME: &str = "config_test.toml";

pub const DEFAULT_POSTGRES_IMAGE: &str = "docker.io/library/postgres:alpine";
pub const DEFAULT_RABBIT_IMAGE: &str = "docker.io/library/rabbitmq:alpine";
pub const DEFAULT_ELASTIC_IMAGE: &str = "docker.io/library/elasticsearch:6.8.4";

pub const DEFAULT_ENV_PREFIX: &str = "APP";
pub const DEFAULT_REMOTE_ENV_PREFIX: &str = "APP_REMOTE";

/// Default grace period for signal-triggered cleanup, in milliseconds.
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 3000;

#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Registry host prepended to image names by [`TestEnvConfig::image`].
    pub host: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for RegistryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryConfig")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Configuration service image, relative to the registry host.
    pub config_service: String,
    /// Image of the module under test, relative to the registry host.
    pub module: String,
    pub postgres: String,
    pub rabbit: String,
    pub elastic: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            config_service: String::new(),
            module: String::new(),
            postgres: DEFAULT_POSTGRES_IMAGE.to_string(),
            rabbit: DEFAULT_RABBIT_IMAGE.to_string(),
            elastic: DEFAULT_ELASTIC_IMAGE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TestEnvConfig {
    pub module_name: String,
    pub registry: RegistryConfig,
    pub images: ImageConfig,
    /// Prefix for the local configuration of application containers.
    pub env_prefix: String,
    /// Prefix for the remote configuration of application containers.
    pub remote_env_prefix: String,
    pub grace_period_ms: u64,
    /// Directory holding backup manifests.
    pub backup_dir: PathBuf,
    /// Sweep leftovers of earlier sessions before starting.
    pub cleanup_on_start: bool,
    /// Skip the tests without starting any containers.
    pub skip: bool,
    pub tracing: TracingConfig,
}

impl Default for TestEnvConfig {
    fn default() -> Self {
        Self {
            module_name: String::new(),
            registry: RegistryConfig::default(),
            images: ImageConfig::default(),
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
            remote_env_prefix: DEFAULT_REMOTE_ENV_PREFIX.to_string(),
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
            backup_dir: PathBuf::from("."),
            cleanup_on_start: false,
            skip: false,
            tracing: TracingConfig::default(),
        }
    }
}

impl TestEnvConfig {
    /// Load `config_test.toml` from `dir`, apply environment overrides and validate.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(CONFIG_FILE_NAME);
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| TestEnvError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&contents)?
            .with_overrides(&std::env::vars().collect())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| TestEnvError::Config(e.to_string()))
    }

    /// Apply `TESTENV_*` overrides from a variable map.
    pub fn with_overrides(mut self, vars: &HashMap<String, String>) -> Result<Self> {
        let text = |key: &str| vars.get(key).cloned();

        if let Some(value) = text("TESTENV_MODULE_NAME") {
            self.module_name = value;
        }
        if let Some(value) = text("TESTENV_REGISTRY_HOST") {
            self.registry.host = value;
        }
        if let Some(value) = text("TESTENV_REGISTRY_USERNAME") {
            self.registry.username = value;
        }
        if let Some(value) = text("TESTENV_REGISTRY_PASSWORD") {
            self.registry.password = value;
        }
        if let Some(value) = text("TESTENV_IMAGES_MODULE") {
            self.images.module = value;
        }
        if let Some(value) = text("TESTENV_IMAGES_CONFIG_SERVICE") {
            self.images.config_service = value;
        }
        if let Some(value) = text("TESTENV_BACKUP_DIR") {
            self.backup_dir = PathBuf::from(value);
        }
        if let Some(value) = text("TESTENV_GRACE_PERIOD_MS") {
            self.grace_period_ms = value.parse().map_err(|e| {
                TestEnvError::Config(format!(
                    "TESTENV_GRACE_PERIOD_MS must be a positive integer, got '{}': {}",
                    value, e
                ))
            })?;
        }
        if let Some(value) = text("TESTENV_CLEANUP_ON_START") {
            self.cleanup_on_start = parse_flag("TESTENV_CLEANUP_ON_START", &value)?;
        }
        if let Some(value) = text("TESTENV_SKIP") {
            self.skip = parse_flag("TESTENV_SKIP", &value)?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.module_name.trim().is_empty() {
            return Err(TestEnvError::Config("module_name must not be empty".to_string()));
        }
        if self.grace_period_ms == 0 {
            return Err(TestEnvError::Config(
                "grace_period_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Image reference under the configured registry host.
    pub fn image(&self, name: &str) -> String {
        if self.registry.host.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.registry.host.trim_end_matches('/'), name)
        }
    }

    /// Credentials for pulls from the configured registry, if a user is set.
    pub fn registry_credentials(&self) -> Option<RegistryCredentials> {
        if self.registry.username.is_empty() {
            return None;
        }
        let mut credentials =
            RegistryCredentials::new(self.registry.username.clone(), self.registry.password.clone());
        if !self.registry.host.is_empty() {
            credentials.server_address = Some(self.registry.host.clone());
        }
        Some(credentials)
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" | "" => Ok(false),
        other => Err(TestEnvError::Config(format!(
            "{} must be a boolean, got '{}'",
            key, other
        ))),
    }
}
