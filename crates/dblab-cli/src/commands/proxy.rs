//! `dblab proxy`: run a SOCKS5 proxy into the cluster network.
//!
//! The proxy is checked every few seconds and reopened through the same
//! gateway if its SSH process died, so long-running clients keep working.

use clap::Args;
use tracing::info;

use dblab_remote::{ProxyManager, ProxyState};

use crate::commands::tunnel::{hold_open, resolve_gateway, HOLD_INTERVAL};
use crate::commands::{require_ssh_key, require_state};
use crate::context::Context;
use crate::pipeline::CommandSpec;
use crate::queue::QueueHandle;
use crate::{Commands, Result};

/// Run a SOCKS5 proxy through a gateway host
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyArgs {
    /// Gateway alias (default: control0, else db0)
    #[arg(long)]
    pub via: Option<String>,

    /// Local SOCKS port (default: any free port)
    #[arg(long)]
    pub port: Option<u16>,
}

pub fn spec() -> CommandSpec<ProxyArgs> {
    CommandSpec::new("proxy", execute)
        .require(require_state)
        .require(require_ssh_key)
        .after(stop_proxy)
}

/// Start the proxy described by `args` on `manager`
pub fn start_proxy(ctx: &Context, manager: &ProxyManager, args: &ProxyArgs) -> Result<ProxyState> {
    let state = ctx.load_state()?;
    let gateway = resolve_gateway(&state, args.via.as_deref())?;
    Ok(manager.ensure_running(gateway)?)
}

fn execute(ctx: &Context, args: &ProxyArgs, _queue: &QueueHandle<Commands>) -> Result<()> {
    let fixed;
    let manager = match args.port {
        Some(port) => {
            fixed = ProxyManager::new(ctx.factory.transport(), ctx.resources.clone())
                .with_local_port(port);
            &fixed
        }
        None => &ctx.proxy,
    };

    let proxy = start_proxy(ctx, manager, args)?;
    info!(gateway = %proxy.gateway, url = %proxy.socks_url(), "Proxy ready");
    println!("SOCKS proxy on {} via {} (Ctrl-C to stop)", proxy.socks_url(), proxy.gateway);

    let mut port = proxy.local_port;
    hold_open(HOLD_INTERVAL, || {
        let current = start_proxy(ctx, manager, args)?;
        if current.local_port != port {
            println!("Proxy reopened on {}", current.socks_url());
            port = current.local_port;
        }
        Ok(true)
    })
}

/// Post-hook: close the shared proxy if it is still up
fn stop_proxy(ctx: &Context, _args: &ProxyArgs) -> Result<()> {
    Ok(ctx.proxy.stop()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::lab_state;
    use crate::context::tests::{context_with, FakeChannel, FakeFactory, MockTransport};
    use dblab_remote::ssh::ForwardSpec;
    use parking_lot::Mutex;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    // ==========================================================================
    // Story: Proxying through a gateway
    // ==========================================================================

    #[test]
    fn when_starting_twice_the_same_proxy_is_reused() {
        let (channel, _alive, closes) = FakeChannel::new(1080);
        let channel = Mutex::new(Some(channel));
        let mut transport = MockTransport::new();
        transport
            .expect_open_forward()
            .withf(|gateway, spec| gateway == "54.0.0.1" && matches!(spec, ForwardSpec::Dynamic { .. }))
            .times(1)
            .returning(move |_, _| Ok(Box::new(channel.lock().take().unwrap())));
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with(
            dir.path(),
            FakeFactory {
                transport: Arc::new(transport),
                ..Default::default()
            },
        );
        ctx.save_state(&lab_state()).unwrap();
        let args = ProxyArgs {
            via: Some("db1".to_string()),
            port: None,
        };

        let first = start_proxy(&ctx, &ctx.proxy, &args).unwrap();
        let second = start_proxy(&ctx, &ctx.proxy, &args).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.gateway, "db1");

        stop_proxy(&ctx, &args).unwrap();
        stop_proxy(&ctx, &args).unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(ctx.proxy.current().is_none());
    }
}
