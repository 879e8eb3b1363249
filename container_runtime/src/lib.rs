//! Container Runtime implementations for the test environment.
//!
//! This crate provides implementations of the `ContainerRuntime` trait:
//! - `DockerRuntime`: Docker engine API client (requires `docker-runtime` feature)
//! - `MockRuntime`: In-memory runtime that records calls, for tests (requires
//!   `mock-runtime` feature)

#[cfg(feature = "docker-runtime")]
pub mod docker;

#[cfg(feature = "mock-runtime")]
pub mod mock;

// Re-export common types
pub use container_runtime_interface::{
    ByteStream, ContainerRuntime, CreateContainerOptions, RegistryCredentials, RuntimeError,
};

#[cfg(feature = "docker-runtime")]
pub use docker::{DockerConnectError, DockerRuntime, DockerRuntimeConfig};

#[cfg(feature = "mock-runtime")]
pub use mock::MockRuntime;
