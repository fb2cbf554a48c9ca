use std::fmt;
use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum KilnError {
    #[error("I/O Error: {0}")]
    Io(#[from] Arc<std::io::Error>),

    #[error("HTTP Request Error: {0}")]
    Http(#[from] Arc<reqwest::Error>),

    #[error("JSON Parsing Error: {0}")]
    Json(#[from] Arc<serde_json::Error>),

    #[error("TOML Parsing Error: {0}")]
    Toml(#[from] Arc<toml::de::Error>),

    #[error("Git Error: {0}")]
    Git(#[from] Arc<git2::Error>),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("Validation Error: {0}")]
    ValidationError(String),

    #[error("Parsing Error in {0}: {1}")]
    ParseError(&'static str, String),

    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// Transient transport failure. Only ever surfaced to callers wrapped in
    /// `FetchFailed` once the retry budget is spent.
    #[error("Network Error: {0}")]
    Network(String),

    #[error("Failed to fetch '{url}' after {attempts} attempt(s): {reason}")]
    FetchFailed {
        url: String,
        attempts: u32,
        reason: String,
    },

    #[error("Dependency cycle detected: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error("Unresolved dependency '{dependency}' of '{formula}': {reason}")]
    UnresolvedDependency {
        formula: String,
        dependency: String,
        reason: String,
    },

    #[error("Build step {step} failed with exit code {exit_code}")]
    BuildStepFailed { step: usize, exit_code: i32 },

    #[error("Assertion failed: {0}")]
    AssertionFailed(String),

    #[error("Sandbox violation: {0}")]
    SandboxViolation(String),

    #[error("Build environment setup failed: {0}")]
    BuildEnvError(String),

    #[error("Failed to execute command: {0}")]
    CommandExecError(String),

    #[error("Installation Error: {0}")]
    InstallError(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Generic Error: {0}")]
    Generic(String),
}

/// Coarse failure classes, used for process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Fetch,
    Dependency,
    Build,
    Test,
    Cancelled,
    Other,
}

impl ErrorCategory {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Other => 1,
            Self::Fetch => 2,
            Self::Dependency => 3,
            Self::Build => 4,
            Self::Test => 5,
            Self::Cancelled => 130,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fetch => "fetch",
            Self::Dependency => "dependency",
            Self::Build => "build",
            Self::Test => "test",
            Self::Cancelled => "cancelled",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

impl KilnError {
    /// Whether the source acquirer may retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ChecksumMismatch { .. } | Self::FetchFailed { .. } | Self::Network(_) => {
                ErrorCategory::Fetch
            }
            Self::DependencyCycle(_) | Self::UnresolvedDependency { .. } => {
                ErrorCategory::Dependency
            }
            Self::BuildStepFailed { .. } | Self::SandboxViolation(_) => ErrorCategory::Build,
            Self::AssertionFailed(_) => ErrorCategory::Test,
            Self::Cancelled => ErrorCategory::Cancelled,
            _ => ErrorCategory::Other,
        }
    }
}

impl From<std::io::Error> for KilnError {
    fn from(err: std::io::Error) -> Self {
        KilnError::Io(Arc::new(err))
    }
}

impl From<reqwest::Error> for KilnError {
    fn from(err: reqwest::Error) -> Self {
        KilnError::Http(Arc::new(err))
    }
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        KilnError::Json(Arc::new(err))
    }
}

impl From<toml::de::Error> for KilnError {
    fn from(err: toml::de::Error) -> Self {
        KilnError::Toml(Arc::new(err))
    }
}

impl From<git2::Error> for KilnError {
    fn from(err: git2::Error) -> Self {
        KilnError::Git(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, KilnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_map_to_distinct_exit_codes() {
        let fetch = KilnError::FetchFailed {
            url: "https://example.invalid/x.git".into(),
            attempts: 3,
            reason: "timed out".into(),
        };
        assert_eq!(fetch.category(), ErrorCategory::Fetch);
        assert_eq!(fetch.category().exit_code(), 2);

        let cycle = KilnError::DependencyCycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(cycle.category().exit_code(), 3);
        assert_eq!(cycle.to_string(), "Dependency cycle detected: a -> b -> a");

        let build = KilnError::BuildStepFailed {
            step: 0,
            exit_code: 1,
        };
        assert_eq!(build.category().exit_code(), 4);
        assert_eq!(
            KilnError::AssertionFailed("bin/dvd exists".into())
                .category()
                .exit_code(),
            5
        );
        assert_eq!(KilnError::Generic("x".into()).category().exit_code(), 1);
    }

    #[test]
    fn only_transport_errors_are_retryable() {
        assert!(KilnError::Network("connection reset".into()).is_retryable());
        assert!(!KilnError::ChecksumMismatch {
            path: "a.tar.gz".into(),
            expected: "00".into(),
            actual: "11".into(),
        }
        .is_retryable());
        assert!(!KilnError::FetchFailed {
            url: "u".into(),
            attempts: 1,
            reason: "r".into()
        }
        .is_retryable());
    }
}
