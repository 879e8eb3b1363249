//! Per-run naming.
//!
//! Every resource a test run creates carries the session's build name, so
//! parallel runs on one host never collide and leftovers can be traced back
//! to the run that made them.

use chrono::Utc;
use uuid::Uuid;

/// File name prefix of backup manifests. The crash-recovery sweep only looks
/// at files starting with this prefix.
pub const BACKUP_FILE_PREFIX: &str = "testenv-docker-session_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    module_name: String,
    token: String,
}

impl SessionContext {
    /// New session with a fresh token: zero-padded UTC nanoseconds plus a
    /// short random suffix.
    pub fn new(module_name: &str) -> Self {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let suffix = Uuid::new_v4().simple().to_string();
        Self::with_token(module_name, format!("{:020}-{}", nanos, &suffix[..8]))
    }

    /// Session with a caller-chosen token.
    pub fn with_token(module_name: &str, token: impl Into<String>) -> Self {
        Self {
            module_name: sanitize(module_name),
            token: token.into(),
        }
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// `{module}-{token}`
    pub fn build_name(&self) -> String {
        if self.module_name.is_empty() {
            self.token.clone()
        } else {
            format!("{}-{}", self.module_name, self.token)
        }
    }

    pub fn network_name(&self) -> String {
        format!("testenv-network-{}", self.build_name())
    }

    /// Unique container name derived from a service name, e.g. `pgsql`.
    pub fn container_name(&self, base: &str) -> String {
        format!("testenv-{}-{}", sanitize(base), self.build_name())
    }

    pub fn backup_file_name(&self) -> String {
        format!("{}{}", BACKUP_FILE_PREFIX, self.token)
    }
}

/// Container engines accept `[a-zA-Z0-9][a-zA-Z0-9_.-]*` for names.
fn sanitize(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>()
        .trim_start_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_derived_from_build_name() {
        let session = SessionContext::with_token("billing", "00000000000000000042-abcd1234");
        assert_eq!(session.build_name(), "billing-00000000000000000042-abcd1234");
        assert_eq!(
            session.network_name(),
            "testenv-network-billing-00000000000000000042-abcd1234"
        );
        assert_eq!(
            session.container_name("pgsql"),
            "testenv-pgsql-billing-00000000000000000042-abcd1234"
        );
        assert_eq!(
            session.backup_file_name(),
            "testenv-docker-session_00000000000000000042-abcd1234"
        );
    }

    #[test]
    fn test_tokens_are_unique() {
        let a = SessionContext::new("svc");
        let b = SessionContext::new("svc");
        assert_ne!(a.token(), b.token());
        assert_eq!(a.token().len(), 29);
    }

    #[test]
    fn test_module_name_is_sanitized() {
        let session = SessionContext::with_token(" My Service/v2", "t");
        assert_eq!(session.module_name(), "my-service-v2");
        assert_eq!(SessionContext::with_token("", "t").build_name(), "t");
    }
}
