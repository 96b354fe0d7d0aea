//! `dblab up`: create whatever the cluster definition is missing.
//!
//! Every increment the provisioner reports is merged into the state and
//! persisted right away, so an interrupted `up` never loses hosts that were
//! already created. Running `up` again only creates what is still missing.

use clap::Args;
use parking_lot::Mutex;
use tracing::{info, warn};

use dblab_cloud::{CreatedResource, Placement, ProvisioningRequest};
use dblab_common::ClusterState;

use crate::commands::hostfiles::write_host_files;
use crate::commands::{backup_after, require_state};
use crate::context::Context;
use crate::pipeline::CommandSpec;
use crate::queue::QueueHandle;
use crate::{Commands, Error, Result};

/// Provision missing hosts and add-ons
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct UpArgs {}

pub fn spec() -> CommandSpec<UpArgs> {
    CommandSpec::new("up", execute)
        .require(require_state)
        .after(write_files)
        .on_success(backup_after)
}

/// Merge one provisioned increment into the state
pub fn apply_created(state: &mut ClusterState, resource: &CreatedResource) {
    match resource {
        CreatedResource::Hosts { role, hosts } => {
            let added = state.add_hosts(*role, hosts.iter().cloned());
            info!(cluster = %state.name, role = %role, added, "Recorded new hosts");
        }
        CreatedResource::Spark(spark) => state.add_ons.spark = Some(spark.clone()),
        CreatedResource::OpenSearch(search) => state.add_ons.opensearch = Some(search.clone()),
    }
}

fn execute(ctx: &Context, _args: &UpArgs, _queue: &QueueHandle<Commands>) -> Result<()> {
    let state = ctx.load_state()?;
    let init = state
        .init_config
        .clone()
        .ok_or_else(|| Error::validation("state has no init config; run 'dblab init'"))?;

    let placement = Placement {
        ami: init.ami.clone(),
        subnet_ids: state.infrastructure.subnet_ids.clone(),
        security_group_id: state.infrastructure.security_group_id.clone(),
        key_name: ctx.profile.key_pair_name.clone(),
    };
    let request = ProvisioningRequest::plan(
        &state.cluster_id,
        &state.name,
        &init,
        &state.hosts,
        &state.add_ons,
        &placement,
    );
    for unit in request.units.iter().filter(|u| u.needed() > 0) {
        info!(cluster = %state.name, "Planned {}", unit.description());
    }

    let existing = state.hosts.clone();
    let store = &ctx.store;
    let shared = Mutex::new(state);
    let on_created = |resource: &CreatedResource| {
        let mut state = shared.lock();
        apply_created(&mut state, resource);
        if let Err(e) = store.save(&state) {
            warn!(cluster = %state.name, error = %e, "Failed to persist provisioned resource");
        }
    };

    let result = ctx
        .factory
        .provisioner()
        .provision(&request, &existing, &on_created);

    let state = shared.into_inner();
    ctx.save_state(&state)?;
    println!("{}: {}", state.name, result.summary());

    if !result.is_success() {
        return Err(Error::command_failed(result.summary()));
    }
    Ok(())
}

/// Post-hook: regenerate sshConfig and env.sh for whatever hosts exist
fn write_files(ctx: &Context, _args: &UpArgs) -> Result<()> {
    let state = ctx.load_state()?;
    write_host_files(&state, &ctx.profile, &ctx.work_dir)
}
