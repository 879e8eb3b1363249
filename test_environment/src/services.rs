//! Ready-made launchers for common dependencies.
//!
//! Each launcher starts the service inside the session network and returns a
//! connection configuration addressed by the container's in-network IP.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::container::ContainerHandle;
use crate::environment::TestEnvironment;
use crate::error::{Result, TestEnvError};
use crate::options::RunOptions;
use crate::session::SessionContext;

pub const POSTGRES_PORT: &str = "5432";
pub const POSTGRES_DATABASE: &str = "testenv";
pub const POSTGRES_PASSWORD: &str = "testenv-secret";

pub const RABBIT_PORT: &str = "5672";
pub const RABBIT_USER: &str = "guest";
pub const RABBIT_PASSWORD: &str = "guest";

pub const ELASTIC_PORT: &str = "9200";

pub const CONFIG_SERVICE_HTTP_PORT: &str = "9001";
pub const CONFIG_SERVICE_GRPC_PORT: &str = "9002";
pub const CONFIG_SERVICE_SCHEMA: &str = "config_service";
pub const CONFIG_SERVICE_MODULE_NAME: &str = "config";

const BIND_ADDRESS: &str = "0.0.0.0";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressConfiguration {
    pub ip: String,
    pub port: String,
}

impl AddressConfiguration {
    pub fn new(ip: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            port: port.into(),
        }
    }

    /// `ip:port`
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbConfiguration {
    pub address: String,
    pub port: String,
    pub database: String,
    pub schema: String,
    pub username: String,
    pub password: String,
    pub create_schema: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RabbitConfiguration {
    pub address: AddressConfiguration,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElasticConfiguration {
    pub url: String,
    pub sniff: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerConfiguration {
    pub rest: AddressConfiguration,
    pub grpc: AddressConfiguration,
}

/// Local configuration handed to the configuration service container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigServiceConfiguration {
    pub database: DbConfiguration,
    pub grpc_outer_address: AddressConfiguration,
    pub module_name: String,
    pub ws: ListenerConfiguration,
}

/// Local configuration for a module that registers with the configuration service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleConfiguration {
    pub config_service_address: AddressConfiguration,
    pub grpc_outer_address: AddressConfiguration,
    pub grpc_inner_address: AddressConfiguration,
    pub module_name: String,
}

// ==================== Session Defaults ====================

impl SessionContext {
    /// Database settings for the session's PostgreSQL container, addressed by
    /// container name.
    pub fn db_configuration(&self) -> DbConfiguration {
        DbConfiguration {
            address: self.container_name("pgsql"),
            port: POSTGRES_PORT.to_string(),
            database: POSTGRES_DATABASE.to_string(),
            schema: String::new(),
            username: POSTGRES_DATABASE.to_string(),
            password: POSTGRES_PASSWORD.to_string(),
            create_schema: true,
        }
    }

    pub fn rabbit_configuration(&self) -> RabbitConfiguration {
        RabbitConfiguration {
            address: AddressConfiguration::new(self.container_name("rabbit"), RABBIT_PORT),
            user: RABBIT_USER.to_string(),
            password: RABBIT_PASSWORD.to_string(),
        }
    }

    pub fn elastic_configuration(&self) -> ElasticConfiguration {
        ElasticConfiguration {
            url: format!("http://{}:{}", self.container_name("elastic"), ELASTIC_PORT),
            sniff: Some(false),
        }
    }

    pub fn config_service_address(&self) -> AddressConfiguration {
        AddressConfiguration::new(self.container_name("config-service"), CONFIG_SERVICE_HTTP_PORT)
    }

    pub fn config_service_configuration(&self) -> ConfigServiceConfiguration {
        let mut database = self.db_configuration();
        database.schema = CONFIG_SERVICE_SCHEMA.to_string();
        ConfigServiceConfiguration {
            database,
            grpc_outer_address: AddressConfiguration::new(
                self.container_name("config-service"),
                CONFIG_SERVICE_GRPC_PORT,
            ),
            module_name: CONFIG_SERVICE_MODULE_NAME.to_string(),
            ws: ListenerConfiguration {
                rest: AddressConfiguration::new(BIND_ADDRESS, CONFIG_SERVICE_HTTP_PORT),
                grpc: AddressConfiguration::new(BIND_ADDRESS, CONFIG_SERVICE_GRPC_PORT),
            },
        }
    }

    /// Local configuration for the module `module_name` listening on `port`.
    pub fn module_configuration(&self, port: &str, module_name: &str) -> ModuleConfiguration {
        ModuleConfiguration {
            config_service_address: self.config_service_address(),
            grpc_outer_address: AddressConfiguration::new(self.container_name(module_name), port),
            grpc_inner_address: AddressConfiguration::new(BIND_ADDRESS, port),
            module_name: module_name.to_string(),
        }
    }
}

// ==================== Launchers ====================

impl TestEnvironment {
    /// PostgreSQL with the session database and credentials.
    pub async fn run_postgres(&self, options: RunOptions) -> Result<(Arc<ContainerHandle>, DbConfiguration)> {
        let mut db = self.session().db_configuration();
        let options = options
            .default_name(db.address.clone())
            .default_pull(None)
            .default_env([
                ("POSTGRES_USER", db.username.clone()),
                ("POSTGRES_PASSWORD", db.password.clone()),
                ("POSTGRES_DB", db.database.clone()),
            ]);

        let image = self.config().images.postgres.clone();
        let (handle, ip_address) = self.run_dependency_container(&image, options).await?;
        db.address = ip_address;
        Ok((handle, db))
    }

    pub async fn run_rabbit(&self, options: RunOptions) -> Result<(Arc<ContainerHandle>, RabbitConfiguration)> {
        let mut rabbit = self.session().rabbit_configuration();
        let options = options
            .default_name(rabbit.address.ip.clone())
            .default_pull(None);

        let image = self.config().images.rabbit.clone();
        let (handle, ip_address) = self.run_dependency_container(&image, options).await?;
        rabbit.address.ip = ip_address;
        Ok((handle, rabbit))
    }

    /// Single-node Elasticsearch with a small heap.
    pub async fn run_elastic(&self, options: RunOptions) -> Result<(Arc<ContainerHandle>, ElasticConfiguration)> {
        let mut elastic = self.session().elastic_configuration();
        let options = options
            .default_name(self.session().container_name("elastic"))
            .default_pull(None)
            .default_env([
                ("discovery.type", "single-node"),
                ("ES_JAVA_OPTS", "-Xms512m -Xmx512m"),
            ]);

        let image = self.config().images.elastic.clone();
        let (handle, ip_address) = self.run_dependency_container(&image, options).await?;
        elastic.url = format!("http://{}:{}", ip_address, ELASTIC_PORT);
        Ok((handle, elastic))
    }

    /// The configuration service, pulled from the configured registry. It
    /// stores its state in the session database, so [`Self::run_postgres`]
    /// should run first.
    pub async fn run_config_service(
        &self,
        options: RunOptions,
    ) -> Result<(Arc<ContainerHandle>, AddressConfiguration)> {
        let config = self.config();
        if config.images.config_service.is_empty() {
            return Err(TestEnvError::Config(
                "images.config_service is not configured".to_string(),
            ));
        }

        let mut address = self.session().config_service_address();
        let options = options
            .default_name(address.ip.clone())
            .default_pull(config.registry_credentials());
        let image = config.image(&config.images.config_service);
        let local = self.session().config_service_configuration();

        let handle = self
            .run_application_container(&image, &local, None::<&()>, options)
            .await?;
        address.ip = handle.ip_address().await;
        Ok((handle, address))
    }
}
