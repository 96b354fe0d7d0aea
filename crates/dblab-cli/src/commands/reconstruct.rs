//! `dblab reconstruct`: rebuild `state.json` from cloud resource tags.

use clap::Args;
use tracing::info;

use dblab_common::reconstruct::reconstruct_from_tag;
use dblab_common::types::host_count;

use crate::commands::hostfiles::write_host_files;
use crate::context::Context;
use crate::pipeline::CommandSpec;
use crate::queue::QueueHandle;
use crate::{Commands, Error, Result};

/// Recover cluster state from a tagged network
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct ReconstructArgs {
    /// Network (VPC) id carrying the ClusterId tag
    #[arg(long)]
    pub network_id: String,

    /// Replace an existing state.json
    #[arg(long)]
    pub force: bool,
}

pub fn spec() -> CommandSpec<ReconstructArgs> {
    CommandSpec::new("reconstruct", execute)
}

fn execute(ctx: &Context, args: &ReconstructArgs, _queue: &QueueHandle<Commands>) -> Result<()> {
    if ctx.store.exists() && !args.force {
        return Err(Error::validation(format!(
            "{} already exists; use --force to replace it",
            ctx.store.path().display()
        )));
    }

    let discovery = ctx.factory.discovery();
    let mut state = reconstruct_from_tag(discovery.as_ref(), &args.network_id)?;
    if ctx.store.exists() {
        // Keep what tags cannot tell us.
        if let Ok(previous) = ctx.load_state() {
            state.init_config = previous.init_config;
            state.backup_hashes = previous.backup_hashes;
            state.created_at = previous.created_at.or(state.created_at);
            if state.bucket.is_none() {
                state.bucket = previous.bucket;
            }
        }
    }
    ctx.save_state(&state)?;
    write_host_files(&state, &ctx.profile, &ctx.work_dir)?;
    info!(cluster = %state.name, cluster_id = %state.cluster_id, "Reconstructed state");
    println!("{}: recovered {} hosts", state.name, host_count(&state.hosts));
    Ok(())
}
