//! `dblab down`: terminate every instance of the cluster.

use clap::Args;
use tracing::info;

use crate::commands::backup::BackupArgs;
use crate::commands::require_state;
use crate::context::Context;
use crate::pipeline::CommandSpec;
use crate::queue::QueueHandle;
use crate::{Commands, Result};

/// Terminate the cluster's instances and forget its hosts
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct DownArgs {
    /// Skip the backup that normally follows teardown
    #[arg(long)]
    pub no_backup: bool,
}

pub fn spec() -> CommandSpec<DownArgs> {
    CommandSpec::new("down", execute).require(require_state)
}

fn execute(ctx: &Context, args: &DownArgs, queue: &QueueHandle<Commands>) -> Result<()> {
    let mut state = ctx.load_state()?;
    let ids: Vec<String> = state
        .hosts
        .values()
        .flatten()
        .map(|h| h.instance_id.clone())
        .collect();

    if ids.is_empty() {
        println!("{}: no instances to terminate", state.name);
    } else {
        info!(cluster = %state.name, instances = ids.len(), "Terminating instances");
        ctx.factory.compute().terminate_instances(&ids)?;
        println!("{}: terminated {} instances", state.name, ids.len());
    }

    ctx.resources.close_all();
    state.clear_hosts();
    ctx.save_state(&state)?;

    if !args.no_backup {
        queue.push(Commands::Backup(BackupArgs::default()));
    }
    Ok(())
}
