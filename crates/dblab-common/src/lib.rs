//! Common types for dblab: cluster state, backup, reconstruction, polling

#![deny(missing_docs)]

pub mod backup;
pub mod config;
pub mod error;
pub mod poll;
pub mod reconstruct;
pub mod state;
pub mod types;

pub use error::Error;
pub use state::{ClusterState, StateStore};
pub use types::{ClusterHost, HostMap, Role};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default SSH port on provisioned hosts
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Database wire-protocol port (CQL)
pub const CQL_PORT: u16 = 9042;

/// Orchestrator API port on control nodes
pub const ORCHESTRATOR_API_PORT: u16 = 6443;
