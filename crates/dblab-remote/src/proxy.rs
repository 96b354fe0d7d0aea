//! SOCKS5 forward proxy through one gateway host.
//!
//! Clients that speak binary protocols to many private endpoints (CQL to every
//! database node, the orchestrator API on control nodes) share one dynamic
//! forward instead of opening a tunnel per destination.
//!
//! At most one proxy is active. Asking for a different gateway while one is
//! running closes the current proxy and opens a new one; the transition is
//! logged.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use dblab_common::ClusterHost;

use crate::resources::{ChannelHandle, ManagedResource, ResourceManager};
use crate::ssh::{free_local_port, ForwardSpec, SshTransport};
use crate::Result;

/// Public view of the running proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyState {
    /// Gateway alias
    pub gateway: String,
    /// Local SOCKS5 port
    pub local_port: u16,
}

impl ProxyState {
    /// Proxy URL with remote DNS resolution, for HTTP clients
    pub fn socks_url(&self) -> String {
        format!("socks5h://127.0.0.1:{}", self.local_port)
    }
}

struct ActiveProxy {
    gateway: ClusterHost,
    handle: Arc<ChannelHandle>,
}

/// Starts, reuses and stops the single SOCKS proxy.
pub struct ProxyManager {
    transport: Arc<dyn SshTransport>,
    resources: Arc<ResourceManager>,
    preferred_port: Option<u16>,
    active: Mutex<Option<ActiveProxy>>,
}

impl ProxyManager {
    /// Create a manager whose proxies are registered with `resources`
    pub fn new(transport: Arc<dyn SshTransport>, resources: Arc<ResourceManager>) -> Self {
        Self {
            transport,
            resources,
            preferred_port: None,
            active: Mutex::new(None),
        }
    }

    /// Listen on a fixed local port instead of an ephemeral one
    pub fn with_local_port(mut self, port: u16) -> Self {
        self.preferred_port = Some(port);
        self
    }

    /// Make sure a proxy through `gateway` is running and return it.
    pub fn ensure_running(&self, gateway: &ClusterHost) -> Result<ProxyState> {
        let mut active = self.active.lock();

        if let Some(current) = active.as_ref() {
            if current.gateway.public_ip == gateway.public_ip {
                if current.handle.is_alive() {
                    debug!(gateway = %gateway.alias, local_port = current.handle.local_port(), "Reusing proxy");
                    return Ok(state_of(current));
                }
                warn!(gateway = %gateway.alias, "Proxy died, reopening");
            } else {
                info!(
                    from = %current.gateway.alias,
                    to = %gateway.alias,
                    "Switching proxy gateway"
                );
            }
        }

        if let Some(previous) = active.take() {
            if let Err(e) = previous.handle.close() {
                warn!(gateway = %previous.gateway.alias, error = %e, "Failed to close previous proxy");
            }
        }

        let local_port = match self.preferred_port {
            Some(port) => port,
            None => free_local_port()?,
        };
        let channel = self
            .transport
            .open_forward(&gateway.public_ip, &ForwardSpec::Dynamic { local_port })?;
        let handle = Arc::new(ChannelHandle::new(
            format!("socks proxy 127.0.0.1:{} via {}", local_port, gateway.alias),
            channel,
        ));
        self.resources.register(handle.clone());

        let proxy = ActiveProxy {
            gateway: gateway.clone(),
            handle,
        };
        let state = state_of(&proxy);
        info!(gateway = %gateway.alias, url = %state.socks_url(), "Proxy running");
        *active = Some(proxy);
        Ok(state)
    }

    /// The running proxy, if any
    pub fn current(&self) -> Option<ProxyState> {
        self.active.lock().as_ref().map(state_of)
    }

    /// Stop the proxy. Does nothing when none is running.
    pub fn stop(&self) -> Result<()> {
        match self.active.lock().take() {
            Some(proxy) => {
                info!(gateway = %proxy.gateway.alias, "Stopping proxy");
                proxy.handle.close()
            }
            None => Ok(()),
        }
    }
}

fn state_of(proxy: &ActiveProxy) -> ProxyState {
    ProxyState {
        gateway: proxy.gateway.alias.clone(),
        local_port: proxy.handle.local_port(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::tests::FakeChannel;
    use crate::ssh::MockSshTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn host(alias: &str, ip: &str) -> ClusterHost {
        ClusterHost::new(ip, "10.0.0.5", alias, "us-west-2a", format!("i-{}", alias))
    }

    // ==========================================================================
    // Story: One proxy per gateway
    // ==========================================================================

    #[test]
    fn when_ensure_running_twice_same_port_and_one_channel() {
        let mut transport = MockSshTransport::new();
        transport
            .expect_open_forward()
            .times(1)
            .returning(|_, spec| Ok(Box::new(FakeChannel::new(spec.local_port()).0)));
        let manager = ProxyManager::new(Arc::new(transport), Arc::new(ResourceManager::new()));
        let gateway = host("control0", "3.3.3.3");

        let first = manager.ensure_running(&gateway).unwrap();
        let second = manager.ensure_running(&gateway).unwrap();

        assert_eq!(first.local_port, second.local_port);
        assert_eq!(first.gateway, "control0");
        assert_eq!(manager.current(), Some(first));
    }

    #[test]
    fn when_stopped_twice_no_error() {
        let closes = Arc::new(AtomicUsize::new(0));
        let seen = closes.clone();
        let mut transport = MockSshTransport::new();
        transport.expect_open_forward().times(1).returning(move |_, spec| {
            let (mut channel, _, _) = FakeChannel::new(spec.local_port());
            channel.closes = seen.clone();
            Ok(Box::new(channel))
        });
        let resources = Arc::new(ResourceManager::new());
        let manager = ProxyManager::new(Arc::new(transport), resources.clone());

        manager.ensure_running(&host("control0", "3.3.3.3")).unwrap();
        manager.stop().unwrap();
        manager.stop().unwrap();
        resources.close_all();

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(manager.current().is_none());
    }

    #[test]
    fn when_gateway_changes_old_proxy_closes_before_new_opens() {
        let closes = Arc::new(AtomicUsize::new(0));
        let seen = closes.clone();
        let mut transport = MockSshTransport::new();
        transport.expect_open_forward().times(2).returning(move |gw, spec| {
            if gw == "4.4.4.4" {
                // The first proxy must already be closed.
                assert_eq!(seen.load(Ordering::SeqCst), 1);
            }
            let (mut channel, _, _) = FakeChannel::new(spec.local_port());
            channel.closes = seen.clone();
            Ok(Box::new(channel))
        });
        let manager = ProxyManager::new(Arc::new(transport), Arc::new(ResourceManager::new()))
            .with_local_port(11080);

        manager.ensure_running(&host("control0", "3.3.3.3")).unwrap();
        let switched = manager.ensure_running(&host("db0", "4.4.4.4")).unwrap();

        assert_eq!(switched.gateway, "db0");
        assert_eq!(switched.local_port, 11080);
        assert_eq!(switched.socks_url(), "socks5h://127.0.0.1:11080");
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn when_proxy_died_it_is_reopened_on_the_same_gateway() {
        let alive_flags = Arc::new(Mutex::new(Vec::new()));
        let flags = alive_flags.clone();
        let mut transport = MockSshTransport::new();
        transport.expect_open_forward().times(2).returning(move |_, spec| {
            let (channel, alive, _) = FakeChannel::new(spec.local_port());
            flags.lock().push(alive);
            Ok(Box::new(channel))
        });
        let manager = ProxyManager::new(Arc::new(transport), Arc::new(ResourceManager::new()));
        let gateway = host("control0", "3.3.3.3");

        manager.ensure_running(&gateway).unwrap();
        alive_flags.lock()[0].store(false, Ordering::SeqCst);
        let state = manager.ensure_running(&gateway).unwrap();

        assert_eq!(state.gateway, "control0");
        assert_eq!(alive_flags.lock().len(), 2);
    }
}
