//! Error types for the test environment.

use std::fmt;

use testenv_shared_types::RuntimeError;

use crate::retry::DeadlineExceeded;

pub type Result<T> = std::result::Result<T, TestEnvError>;

#[derive(Debug, thiserror::Error)]
pub enum TestEnvError {
    /// A container engine call failed. `context` names the operation and target.
    #[error("{context}: {source}")]
    Runtime {
        context: String,
        #[source]
        source: RuntimeError,
    },

    /// One or more failures collected while tearing resources down.
    #[error(transparent)]
    Teardown(#[from] ErrorList),

    #[error("Backup manifest {path}: {message}")]
    Manifest { path: String, message: String },

    #[error(transparent)]
    DeadlineExceeded(#[from] DeadlineExceeded),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl TestEnvError {
    pub fn runtime(context: impl Into<String>, source: RuntimeError) -> Self {
        Self::Runtime {
            context: context.into(),
            source,
        }
    }

    pub fn manifest(path: impl fmt::Display, message: impl Into<String>) -> Self {
        Self::Manifest {
            path: path.to_string(),
            message: message.into(),
        }
    }

    /// The engine error behind this failure, if it came from an engine call.
    pub fn runtime_source(&self) -> Option<&RuntimeError> {
        match self {
            Self::Runtime { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Ordered collection of failures gathered while iterating over resources.
///
/// Collecting never stops an iteration; the list is turned into a single
/// error at the end with [`ErrorList::into_result`].
#[derive(Debug, Default)]
pub struct ErrorList {
    errors: Vec<TestEnvError>,
}

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an error. Nested lists are flattened.
    pub fn push(&mut self, err: TestEnvError) {
        match err {
            TestEnvError::Teardown(list) => self.errors.extend(list.errors),
            other => self.errors.push(other),
        }
    }

    /// Add the error of `result`, if any.
    pub fn push_result(&mut self, result: Result<()>) {
        if let Err(err) = result {
            self.push(err);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TestEnvError> {
        self.errors.iter()
    }

    /// `Ok(())` when nothing was collected, otherwise one combined error.
    pub fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(TestEnvError::Teardown(self))
        }
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.len() == 1 {
            return write!(f, "1 error occurred:\n\t* {}", self.errors[0]);
        }
        write!(f, "{} errors occurred:", self.errors.len())?;
        for err in &self.errors {
            write!(f, "\n\t* {}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorList {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_list_is_ok() {
        assert!(ErrorList::new().into_result().is_ok());
    }

    #[test]
    fn test_list_reports_every_error() {
        let mut errors = ErrorList::new();
        errors.push(TestEnvError::runtime(
            "remove container c-1",
            RuntimeError::engine("remove_container", "conflict"),
        ));
        errors.push_result(Ok(()));
        errors.push_result(Err(TestEnvError::Config("bad".to_string())));
        assert_eq!(errors.len(), 2);

        let message = errors.into_result().unwrap_err().to_string();
        assert!(message.starts_with("2 errors occurred:"));
        assert!(message.contains("remove container c-1"));
        assert!(message.contains("Configuration error: bad"));
    }

    #[test]
    fn test_nested_lists_are_flattened() {
        let mut inner = ErrorList::new();
        inner.push(TestEnvError::InvalidState("a".to_string()));
        inner.push(TestEnvError::InvalidState("b".to_string()));

        let mut outer = ErrorList::new();
        outer.push(TestEnvError::Teardown(inner));
        outer.push(TestEnvError::InvalidState("c".to_string()));
        assert_eq!(outer.len(), 3);
    }
}
