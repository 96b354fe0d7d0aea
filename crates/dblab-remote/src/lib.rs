//! dblab remote access layer
//!
//! Everything that touches a cluster host goes through this crate:
//!
//! - **Gateway**: command execution, file and directory transfer, and
//!   role-grouped host iteration ([`gateway`])
//! - **Tunnels and proxy**: `ssh -L` forwards and the shared SOCKS proxy
//!   ([`tunnel`], [`proxy`]), both cleaned up by the [`resources`] registry
//! - **Services**: systemd lifecycle with per-service readiness ([`service`])
//!
//! The SSH transport is a trait ([`ssh::SshTransport`]) so that everything
//! above it can be tested without a network.

pub mod error;
pub mod filter;
pub mod gateway;
pub mod proxy;
pub mod resources;
pub mod service;
pub mod ssh;
pub mod tunnel;

pub use error::{RemoteError, ServiceError};
pub use filter::TransferFilter;
pub use gateway::{
    with_hosts, HostFilter, HostIteration, ParallelFailure, RemoteOperations, Response,
    SshRemoteOperations,
};
pub use proxy::{ProxyManager, ProxyState};
pub use resources::ResourceManager;
pub use service::{CassandraService, ServiceLifecycle, SystemdService};
pub use ssh::{OpenSsh, SshConfig, SshTransport};
pub use tunnel::{Tunnel, TunnelManager};

/// Result type for remote operations
pub type Result<T> = std::result::Result<T, RemoteError>;
