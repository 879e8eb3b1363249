//! Types shared by every crate of the test-environment workspace.
//!
//! Identifiers are plain strings assigned by the container engine. An empty
//! identifier means "no longer exists" for the handle holding it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Engine-assigned container id.
pub type ContainerId = String;

/// Image reference a container was created from.
pub type ImageId = String;

/// Engine-assigned network id.
pub type NetworkId = String;

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Identity of the isolated network that scopes one test session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkIdentity {
    pub id: NetworkId,
    pub name: String,
}

impl NetworkIdentity {
    pub fn new(id: impl Into<NetworkId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Role a container plays inside a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerKind {
    /// Infrastructure the application depends on (database, broker, search engine).
    Basic,
    /// The software under test.
    App,
}

impl ContainerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::App => "app",
        }
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors reported by a container runtime client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("{operation} failed: {message}")]
    Engine {
        operation: &'static str,
        message: String,
    },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Cannot reach container engine: {0}")]
    Connection(String),

    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl RuntimeError {
    pub fn engine(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Engine {
            operation,
            message: message.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// True when the engine reports the resource as absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
