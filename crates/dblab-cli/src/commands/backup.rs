//! `dblab backup` and `dblab restore`: object-storage copies of the working directory.

use clap::Args;
use tracing::info;

use dblab_common::backup::{default_targets, restore_targets};
use dblab_common::ClusterState;

use crate::commands::{require_state, run_backup};
use crate::context::Context;
use crate::pipeline::CommandSpec;
use crate::queue::QueueHandle;
use crate::{Commands, Error, Result};

/// Upload every changed backup target
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupArgs {}

/// Download backup targets into the working directory
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreArgs {
    /// Cluster name (required when there is no local state.json)
    #[arg(long)]
    pub name: Option<String>,

    /// Cluster id (required when there is no local state.json)
    #[arg(long)]
    pub cluster_id: Option<String>,

    /// Bucket to restore from (defaults to the state's or the profile's)
    #[arg(long)]
    pub bucket: Option<String>,
}

pub fn backup_spec() -> CommandSpec<BackupArgs> {
    CommandSpec::new("backup", execute_backup).require(require_state)
}

pub fn restore_spec() -> CommandSpec<RestoreArgs> {
    CommandSpec::new("restore", execute_restore)
}

fn execute_backup(ctx: &Context, _args: &BackupArgs, _queue: &QueueHandle<Commands>) -> Result<()> {
    let mut state = ctx.load_state()?;
    let uploaded = run_backup(ctx, &mut state);
    println!("{}: {} backup targets uploaded", state.name, uploaded);
    Ok(())
}

/// The state whose prefix a restore reads from
fn restore_source(ctx: &Context, args: &RestoreArgs) -> Result<ClusterState> {
    let mut state = if ctx.store.exists() {
        ctx.load_state()?
    } else {
        match (&args.name, &args.cluster_id) {
            (Some(name), Some(id)) => ClusterState {
                name: name.clone(),
                cluster_id: id.clone(),
                ..Default::default()
            },
            _ => {
                return Err(Error::validation(
                    "no local state.json; pass --name and --cluster-id",
                ))
            }
        }
    };
    if args.bucket.is_some() {
        state.bucket = args.bucket.clone();
    }
    Ok(state)
}

fn execute_restore(ctx: &Context, args: &RestoreArgs, _queue: &QueueHandle<Commands>) -> Result<()> {
    let state = restore_source(ctx, args)?;
    let store = ctx
        .object_store_for(&state)
        .ok_or_else(|| Error::validation("no bucket to restore from"))?;

    info!(cluster = %state.name, prefix = %state.object_prefix(), "Restoring from backup");
    let restored = restore_targets(&state, store.as_ref(), &ctx.work_dir, &default_targets())?;
    if restored.is_empty() {
        return Err(Error::command_failed(format!(
            "nothing found under {}",
            state.object_prefix()
        )));
    }
    println!("{}: restored {}", state.name, restored.join(", "));
    Ok(())
}
