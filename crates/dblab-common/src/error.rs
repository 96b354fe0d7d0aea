//! Error types for cluster state handling
//!
//! Variants carry the context needed to act on them from the CLI: which path
//! failed to load, which backup target failed, which network resource could
//! not be reconstructed.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from state persistence, backup, reconstruction, and polling
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid input
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
    },

    /// Filesystem failure
    #[error("io error [{context}]: {source}")]
    Io {
        /// What was being done (usually includes the path)
        context: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// State document could not be (de)serialized
    #[error("json error [{context}]: {source}")]
    Json {
        /// What was being parsed or written
        context: String,
        /// Underlying error
        #[source]
        source: serde_json::Error,
    },

    /// No state document in the working directory
    #[error("cluster state not found at {}; run `dblab init` first", path.display())]
    StateNotFound {
        /// Expected location of the state document
        path: PathBuf,
    },

    /// Reconstruction could not identify the cluster. Always fatal.
    #[error("cannot reconstruct state from {network_id}: {message}")]
    Reconstruction {
        /// Network resource the reconstruction started from
        network_id: String,
        /// Description of what failed
        message: String,
    },

    /// A single backup target failed. Never aborts the calling command.
    #[error("backup of {target} failed: {message}")]
    Backup {
        /// Backup target name
        target: String,
        /// Description of what failed
        message: String,
    },

    /// Object storage call failed
    #[error("object storage error: {0}")]
    ObjectStore(String),

    /// Cloud metadata query failed
    #[error("discovery error: {0}")]
    Discovery(String),

    /// A bounded wait ran out of time
    #[error("timeout after {seconds}s waiting for {description}")]
    Timeout {
        /// What was being waited for
        description: String,
        /// Configured upper bound in seconds
        seconds: u64,
    },

    /// A bounded wait hit a fatal condition
    #[error("error waiting for {description}: {message}")]
    Poll {
        /// What was being waited for
        description: String,
        /// Description of the fatal condition
        message: String,
    },
}

impl Error {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Wrap an io error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Wrap a serde_json error with context
    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Json {
            context: context.into(),
            source,
        }
    }

    /// Create a fatal reconstruction error
    pub fn reconstruction(network_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Reconstruction {
            network_id: network_id.into(),
            message: message.into(),
        }
    }

    /// Create a backup error for one target
    pub fn backup(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backup {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the same call could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ObjectStore(_) | Error::Discovery(_) | Error::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::reconstruction("vpc-123", "missing ClusterId tag");
        assert_eq!(
            err.to_string(),
            "cannot reconstruct state from vpc-123: missing ClusterId tag"
        );

        let err = Error::Timeout {
            description: "db0 running".to_string(),
            seconds: 300,
        };
        assert_eq!(err.to_string(), "timeout after 300s waiting for db0 running");

        let err = Error::StateNotFound {
            path: PathBuf::from("/tmp/lab/state.json"),
        };
        assert!(err.to_string().contains("/tmp/lab/state.json"));
    }

    #[test]
    fn test_is_retryable() {
        assert!(Error::ObjectStore("throttled".into()).is_retryable());
        assert!(Error::Discovery("503".into()).is_retryable());
        assert!(!Error::validation("bad").is_retryable());
        assert!(!Error::reconstruction("vpc-1", "no tag").is_retryable());
    }
}
