//! Single-destination port forwards through a gateway host.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use dblab_common::ClusterHost;

use crate::resources::{ChannelHandle, ManagedResource, ResourceManager};
use crate::ssh::{free_local_port, ForwardSpec, SshTransport};
use crate::Result;

/// Identity of a forward: at most one open channel exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelKey {
    /// Gateway public address
    pub gateway: String,
    /// Destination as seen from the gateway
    pub remote_host: String,
    /// Destination port
    pub remote_port: u16,
}

/// An open local-to-remote forward.
#[derive(Clone)]
pub struct Tunnel {
    /// Local port to connect to
    pub local_port: u16,
    /// Gateway alias
    pub gateway: String,
    /// Destination host
    pub remote_host: String,
    /// Destination port
    pub remote_port: u16,
    handle: Arc<ChannelHandle>,
}

impl Tunnel {
    /// Whether the forward is still usable
    pub fn is_alive(&self) -> bool {
        self.handle.is_alive()
    }

    /// Close the forward (idempotent)
    pub fn close(&self) -> Result<()> {
        self.handle.close()
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("local_port", &self.local_port)
            .field("gateway", &self.gateway)
            .field("remote_host", &self.remote_host)
            .field("remote_port", &self.remote_port)
            .finish()
    }
}

/// Opens and deduplicates tunnels.
pub struct TunnelManager {
    transport: Arc<dyn SshTransport>,
    resources: Arc<ResourceManager>,
    tunnels: Mutex<HashMap<TunnelKey, Tunnel>>,
}

impl TunnelManager {
    /// Create a manager whose tunnels are registered with `resources`
    pub fn new(transport: Arc<dyn SshTransport>, resources: Arc<ResourceManager>) -> Self {
        Self {
            transport,
            resources,
            tunnels: Mutex::new(HashMap::new()),
        }
    }

    /// Forward a local port to `remote_host:remote_port` through `gateway`.
    ///
    /// Returns the existing tunnel when one with the same key is still alive.
    /// A dead tunnel is replaced. `local_port == None` picks a free port.
    pub fn create_tunnel(
        &self,
        gateway: &ClusterHost,
        remote_host: &str,
        remote_port: u16,
        local_port: Option<u16>,
    ) -> Result<Tunnel> {
        let key = TunnelKey {
            gateway: gateway.public_ip.clone(),
            remote_host: remote_host.to_string(),
            remote_port,
        };

        // Held across open_forward so concurrent requests for one key open one channel.
        let mut tunnels = self.tunnels.lock();
        if let Some(existing) = tunnels.get(&key) {
            if existing.is_alive() {
                debug!(
                    gateway = %gateway.alias,
                    destination = %format!("{}:{}", remote_host, remote_port),
                    local_port = existing.local_port,
                    "Reusing tunnel"
                );
                return Ok(existing.clone());
            }
            warn!(
                gateway = %gateway.alias,
                destination = %format!("{}:{}", remote_host, remote_port),
                "Tunnel died, reopening"
            );
            if let Err(e) = existing.close() {
                debug!(error = %e, "Closing dead tunnel failed");
            }
            tunnels.remove(&key);
        }

        let local_port = match local_port {
            Some(port) => port,
            None => free_local_port()?,
        };
        let spec = ForwardSpec::Local {
            local_port,
            remote_host: remote_host.to_string(),
            remote_port,
        };
        let channel = self.transport.open_forward(&gateway.public_ip, &spec)?;
        let handle = Arc::new(ChannelHandle::new(
            format!(
                "tunnel 127.0.0.1:{} -> {} via {}",
                local_port,
                spec.destination(),
                gateway.alias
            ),
            channel,
        ));
        self.resources.register(handle.clone());

        let tunnel = Tunnel {
            local_port: handle.local_port(),
            gateway: gateway.alias.clone(),
            remote_host: remote_host.to_string(),
            remote_port,
            handle,
        };
        info!(
            gateway = %gateway.alias,
            destination = %spec.destination(),
            local_port = tunnel.local_port,
            "Tunnel open"
        );
        tunnels.insert(key, tunnel.clone());
        Ok(tunnel)
    }

    /// Close the tunnel for a key, if any. Returns whether one was open.
    pub fn close_tunnel(
        &self,
        gateway: &ClusterHost,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<bool> {
        let key = TunnelKey {
            gateway: gateway.public_ip.clone(),
            remote_host: remote_host.to_string(),
            remote_port,
        };
        match self.tunnels.lock().remove(&key) {
            Some(tunnel) => {
                tunnel.close()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Number of tracked tunnels
    pub fn len(&self) -> usize {
        self.tunnels.lock().len()
    }

    /// Whether no tunnels are tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

}
