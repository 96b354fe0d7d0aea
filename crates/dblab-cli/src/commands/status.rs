//! `dblab status`: print what the working directory knows about the cluster.

use std::fmt::Write as _;

use clap::Args;

use dblab_common::{ClusterState, Role};

use crate::commands::require_state;
use crate::context::Context;
use crate::pipeline::CommandSpec;
use crate::queue::QueueHandle;
use crate::{Commands, Result};

/// Show hosts, add-ons and recorded versions
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusArgs {
    /// Print state.json instead of a summary
    #[arg(long)]
    pub json: bool,
}

pub fn spec() -> CommandSpec<StatusArgs> {
    CommandSpec::new("status", execute).require(require_state)
}

fn execute(ctx: &Context, args: &StatusArgs, _queue: &QueueHandle<Commands>) -> Result<()> {
    let state = ctx.load_state()?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else {
        print!("{}", render_status(&state));
    }
    Ok(())
}

/// Human-readable summary of a cluster
pub fn render_status(state: &ClusterState) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Cluster: {} ({})", state.name, state.cluster_id);
    if let Some(created) = state.created_at {
        let _ = writeln!(out, "Created: {}", created.format("%Y-%m-%d %H:%M UTC"));
    }
    if let Some(network) = &state.network_id {
        let _ = writeln!(out, "Network: {}", network);
    }
    let _ = writeln!(out, "Bucket:  {}", state.bucket.as_deref().unwrap_or("-"));

    for role in Role::ALL {
        let hosts = state.hosts_for(role);
        let desired = state.init_config.as_ref().map_or(hosts.len(), |i| i.desired(role));
        if hosts.is_empty() && desired == 0 {
            continue;
        }
        let _ = writeln!(out, "\n{} ({}/{}):", role, hosts.len(), desired);
        for host in hosts {
            let _ = write!(
                out,
                "  {:<10} {:<16} {:<16} {}",
                host.alias, host.public_ip, host.private_ip, host.availability_zone
            );
            if let Some(versions) = state.versions.get(&host.alias) {
                let list: Vec<String> = versions.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                let _ = write!(out, "  [{}]", list.join(", "));
            }
            out.push('\n');
        }
    }

    if let Some(spark) = &state.add_ons.spark {
        let _ = writeln!(
            out,
            "\nspark: {} {} {}",
            spark.cluster_id,
            spark.state,
            spark.master_dns.as_deref().unwrap_or("-")
        );
    }
    if let Some(search) = &state.add_ons.opensearch {
        let _ = writeln!(
            out,
            "\nopensearch: {} {} {}",
            search.domain_name,
            if search.active { "active" } else { "processing" },
            search.endpoint.as_deref().unwrap_or("-")
        );
    }
    out
}
