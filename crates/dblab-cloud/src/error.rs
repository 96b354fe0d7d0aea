//! Error types for cloud API calls and provisioning

use thiserror::Error;

/// Errors from cloud API calls, scoped to the resource being worked on
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The `aws` CLI returned an error
    #[error("aws {operation} failed: {message}")]
    Aws {
        /// CLI operation, e.g. `ec2 run-instances`
        operation: String,
        /// stderr of the CLI
        message: String,
    },

    /// The CLI output did not have the expected shape
    #[error("unexpected output from aws {operation}: {message}")]
    Parse {
        /// CLI operation
        operation: String,
        /// What was missing or malformed
        message: String,
    },

    /// A created resource ended up in an unusable state
    #[error("{resource} failed: {message}")]
    Resource {
        /// Human-readable resource description
        resource: String,
        /// Description of the failure
        message: String,
    },

    /// Wait timeouts and other shared errors
    #[error(transparent)]
    Common(#[from] dblab_common::Error),
}

impl ProvisionError {
    /// Create an aws CLI error
    pub fn aws(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Aws {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a parse error
    pub fn parse(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a resource failure
    pub fn resource(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Resource {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the same call may succeed (API throttling)
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Aws { message, .. } => {
                message.contains("Throttling")
                    || message.contains("RequestLimitExceeded")
                    || message.contains("TooManyRequests")
                    || message.contains("ServiceUnavailable")
            }
            Self::Common(e) => e.is_retryable(),
            _ => false,
        }
    }
}
