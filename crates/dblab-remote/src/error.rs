//! Error types for remote operations

use thiserror::Error;

/// Errors from remote execution, file transfer, and forwarding
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Remote command exited non-zero
    #[error("command on {host} exited with {}: {stderr}", exit_code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    Execution {
        /// Host alias or address
        host: String,
        /// Exit code, `None` if killed by a signal
        exit_code: Option<i32>,
        /// Captured standard error
        stderr: String,
    },

    /// Could not reach the host, or the ssh/scp client failed
    #[error("transport error for {host}: {message}")]
    Transport {
        /// Host alias or address
        host: String,
        /// Description of what failed
        message: String,
    },

    /// A port forward or proxy could not be established
    #[error("tunnel through {gateway} to {destination} failed: {message}")]
    Tunnel {
        /// Gateway host address
        gateway: String,
        /// Forward destination (`host:port`, or `socks` for the proxy)
        destination: String,
        /// Description of what failed
        message: String,
    },

    /// One or more hosts failed during a parallel operation
    #[error("{} host(s) failed: {}", failures.len(), format_failures(failures))]
    HostsFailed {
        /// Host alias -> error message, in host order
        failures: Vec<(String, String)>,
    },

    /// Local filesystem failure
    #[error("io error [{context}]: {source}")]
    Io {
        /// What was being done
        context: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Error from the shared state layer (timeouts, validation)
    #[error(transparent)]
    Common(#[from] dblab_common::Error),
}

impl RemoteError {
    /// Create a transport error
    pub fn transport(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Create a tunnel error
    pub fn tunnel(
        gateway: impl Into<String>,
        destination: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Tunnel {
            gateway: gateway.into(),
            destination: destination.into(),
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
}

fn format_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(host, message)| format!("{}: {}", host, message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors from service lifecycle operations
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The underlying remote operation failed
    #[error("{operation} {service} on {host} failed: {source}")]
    Operation {
        /// Service (unit) name
        service: String,
        /// Lifecycle verb (`start`, `stop`, ...)
        operation: String,
        /// Host alias
        host: String,
        /// Underlying remote error
        #[source]
        source: RemoteError,
    },

    /// The service started but never reported ready
    #[error("{service} on {host} not ready: {message}")]
    NotReady {
        /// Service (unit) name
        service: String,
        /// Host alias
        host: String,
        /// Description of the readiness failure
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RemoteError::Execution {
            host: "db0".into(),
            exit_code: Some(2),
            stderr: "nodetool: connection refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "command on db0 exited with 2: nodetool: connection refused"
        );

        let err = RemoteError::HostsFailed {
            failures: vec![
                ("db0".into(), "boom".into()),
                ("db2".into(), "bang".into()),
            ],
        };
        assert_eq!(err.to_string(), "2 host(s) failed: db0: boom; db2: bang");

        let err = RemoteError::Execution {
            host: "db1".into(),
            exit_code: None,
            stderr: String::new(),
        };
        assert!(err.to_string().contains("signal"));
    }
}
