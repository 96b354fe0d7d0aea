//! `dblab service`: systemd lifecycle across cluster hosts.

use std::collections::BTreeMap;
use std::sync::Arc;

use clap::{Args, ValueEnum};
use parking_lot::Mutex;
use tracing::{info, warn};

use dblab_remote::{with_hosts, CassandraService, RemoteOperations, ServiceLifecycle, SystemdService};

use crate::commands::{require_ssh_key, require_state, HostArgs};
use crate::context::Context;
use crate::pipeline::CommandSpec;
use crate::queue::QueueHandle;
use crate::{Commands, Result};

/// Lifecycle operation
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
    Status,
}

/// Start, stop, restart or inspect a service on every host of a role
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct ServiceArgs {
    /// Operation to run
    #[arg(value_enum)]
    pub action: ServiceAction,

    /// systemd unit name
    pub name: String,

    #[command(flatten)]
    pub target: HostArgs,
}

pub fn spec() -> CommandSpec<ServiceArgs> {
    CommandSpec::new("service", execute)
        .require(require_state)
        .require(require_ssh_key)
}

/// Lifecycle implementation for a unit name
pub fn service_for(name: &str, remote: Arc<dyn RemoteOperations>) -> Box<dyn ServiceLifecycle> {
    match name {
        "cassandra" => Box::new(CassandraService::new(remote)),
        other => Box::new(SystemdService::new(other, remote)),
    }
}

fn execute(ctx: &Context, args: &ServiceArgs, _queue: &QueueHandle<Commands>) -> Result<()> {
    let mut state = ctx.load_state()?;
    args.target.ensure_targets(&state)?;
    let service = service_for(&args.name, ctx.factory.remote());

    let statuses = Mutex::new(BTreeMap::new());
    let versions = Mutex::new(BTreeMap::new());

    let outcome = with_hosts(
        &state.hosts,
        args.target.role,
        &args.target.filter(),
        args.target.iteration(),
        |host| -> Result<()> {
            match args.action {
                ServiceAction::Start | ServiceAction::Restart => {
                    if args.action == ServiceAction::Start {
                        service.start(host)?;
                    } else {
                        service.restart(host)?;
                    }
                    match service.version(host) {
                        Ok(Some(version)) => {
                            versions.lock().insert(host.alias.clone(), version);
                        }
                        Ok(None) => {}
                        Err(e) => warn!(host = %host.alias, error = %e, "Could not read version"),
                    }
                }
                ServiceAction::Stop => service.stop(host)?,
                ServiceAction::Status => {
                    let status = service.get_status(host)?;
                    statuses.lock().insert(host.alias.clone(), status);
                }
            }
            Ok(())
        },
    );

    for (alias, status) in statuses.into_inner() {
        println!("{}: {} {}", alias, args.name, status);
    }

    // Versions from hosts that succeeded are kept even if others failed.
    let versions = versions.into_inner();
    if !versions.is_empty() {
        for (alias, version) in versions {
            info!(host = %alias, service = %args.name, version = %version, "Recorded version");
            state.set_version(&alias, &args.name, version);
        }
        ctx.save_state(&state)?;
    }

    outcome
}
