//! `dblab tunnel`: forward a local port into the cluster network and hold it open.

use std::thread;
use std::time::Duration;

use clap::Args;
use tracing::info;

use dblab_common::{ClusterHost, ClusterState, CQL_PORT};
use dblab_remote::Tunnel;

use crate::commands::{require_ssh_key, require_state};
use crate::context::Context;
use crate::pipeline::CommandSpec;
use crate::queue::QueueHandle;
use crate::{Commands, Error, Result};

/// How often a held-open forward is checked
pub const HOLD_INTERVAL: Duration = Duration::from_secs(2);

/// Forward a local port to a host inside the cluster
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct TunnelArgs {
    /// Destination host alias (resolved to its private address) or address
    #[arg(long, default_value = "db0")]
    pub to: String,

    /// Destination port
    #[arg(long, default_value_t = CQL_PORT)]
    pub port: u16,

    /// Local port (default: any free port)
    #[arg(long)]
    pub local_port: Option<u16>,

    /// Gateway alias (default: control0, else db0)
    #[arg(long)]
    pub via: Option<String>,
}

pub fn spec() -> CommandSpec<TunnelArgs> {
    CommandSpec::new("tunnel", execute)
        .require(require_state)
        .require(require_ssh_key)
}

/// Gateway host: the named alias, or the state's default gateway
pub fn resolve_gateway<'a>(state: &'a ClusterState, via: Option<&str>) -> Result<&'a ClusterHost> {
    match via {
        Some(alias) => state
            .find_host(alias)
            .ok_or_else(|| Error::validation(format!("no host named {}", alias))),
        None => state.gateway_host().ok_or_else(|| Error::NoHosts {
            role: "control or database".to_string(),
            cluster: state.name.clone(),
        }),
    }
}

/// Private address for a known alias; anything else is used verbatim
pub fn resolve_destination(state: &ClusterState, to: &str) -> String {
    state
        .find_host(to)
        .map(|h| h.private_ip.clone())
        .unwrap_or_else(|| to.to_string())
}

/// Open (or reuse) the forward described by `args`
pub fn open_tunnel(ctx: &Context, state: &ClusterState, args: &TunnelArgs) -> Result<Tunnel> {
    let gateway = resolve_gateway(state, args.via.as_deref())?;
    let destination = resolve_destination(state, &args.to);
    Ok(ctx
        .tunnels
        .create_tunnel(gateway, &destination, args.port, args.local_port)?)
}

/// Block while `alive` keeps answering true
pub fn hold_open(interval: Duration, mut alive: impl FnMut() -> Result<bool>) -> Result<()> {
    while alive()? {
        thread::sleep(interval);
    }
    Ok(())
}

fn execute(ctx: &Context, args: &TunnelArgs, _queue: &QueueHandle<Commands>) -> Result<()> {
    let state = ctx.load_state()?;
    let tunnel = open_tunnel(ctx, &state, args)?;

    info!(
        gateway = %tunnel.gateway,
        destination = %format!("{}:{}", tunnel.remote_host, tunnel.remote_port),
        local_port = tunnel.local_port,
        "Tunnel open"
    );
    println!(
        "Forwarding 127.0.0.1:{} -> {}:{} via {} (Ctrl-C to stop)",
        tunnel.local_port, tunnel.remote_host, tunnel.remote_port, tunnel.gateway
    );

    hold_open(HOLD_INTERVAL, || Ok(tunnel.is_alive()))?;
    let gateway = resolve_gateway(&state, args.via.as_deref())?;
    ctx.tunnels
        .close_tunnel(gateway, &tunnel.remote_host, tunnel.remote_port)?;
    Err(Error::command_failed(format!(
        "tunnel to {}:{} closed",
        tunnel.remote_host, tunnel.remote_port
    )))
}
