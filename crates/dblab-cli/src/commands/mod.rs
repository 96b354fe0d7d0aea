//! CLI commands

use std::fmt::Display;

use clap::Args;
use tracing::{info, warn};

use dblab_common::backup::{backup_changed, default_targets};
use dblab_common::{ClusterState, Role};
use dblab_remote::{HostFilter, HostIteration, ParallelFailure};

use crate::context::Context;
use crate::{Error, Result};

pub mod backup;
pub mod down;
pub mod exec;
pub mod hostfiles;
pub mod init;
pub mod proxy;
pub mod reconstruct;
pub mod service;
pub mod status;
pub mod tunnel;
pub mod up;

/// Extension trait to convert errors with Display to CLI Error::CommandFailed.
///
/// This reduces boilerplate for the common pattern of `.map_err(|e| Error::command_failed(e.to_string()))`.
pub trait CommandErrorExt<T> {
    /// Convert an error to `Error::CommandFailed` using its Display implementation.
    fn cmd_err(self) -> Result<T>;
}

impl<T, E: Display> CommandErrorExt<T> for std::result::Result<T, E> {
    fn cmd_err(self) -> Result<T> {
        self.map_err(|e| Error::command_failed(e.to_string()))
    }
}

/// Which hosts a per-host command targets and how it visits them.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct HostArgs {
    /// Host role (db, stress, control)
    #[arg(long, short = 'r', default_value = "db", value_parser = parse_role)]
    pub role: Role,

    /// Comma-separated aliases to restrict to (e.g. db0,db2)
    #[arg(long)]
    pub hosts: Option<String>,

    /// Run on every host at once instead of one after another
    #[arg(long, short = 'p')]
    pub parallel: bool,

    /// With --parallel, log per-host failures instead of failing the command
    #[arg(long, requires = "parallel")]
    pub warn_on_failure: bool,
}

impl Default for HostArgs {
    fn default() -> Self {
        Self {
            role: Role::Database,
            hosts: None,
            parallel: false,
            warn_on_failure: false,
        }
    }
}

impl HostArgs {
    pub fn filter(&self) -> HostFilter {
        self.hosts
            .as_deref()
            .map(HostFilter::parse)
            .unwrap_or_default()
    }

    pub fn iteration(&self) -> HostIteration {
        match (self.parallel, self.warn_on_failure) {
            (false, _) => HostIteration::Sequential,
            (true, false) => HostIteration::Parallel(ParallelFailure::Propagate),
            (true, true) => HostIteration::Parallel(ParallelFailure::Warn),
        }
    }

    /// Fail when the filter leaves no host to act on
    pub fn ensure_targets(&self, state: &ClusterState) -> Result<()> {
        let filter = self.filter();
        if state.hosts_for(self.role).iter().any(|h| filter.matches(h)) {
            return Ok(());
        }
        Err(Error::NoHosts {
            role: self.role.to_string(),
            cluster: state.name.clone(),
        })
    }
}

fn parse_role(s: &str) -> std::result::Result<Role, String> {
    s.parse::<Role>().map_err(|e| e.to_string())
}

/// Requirement: `state.json` exists in the working directory
pub fn require_state(ctx: &Context) -> Result<()> {
    if ctx.store.exists() {
        return Ok(());
    }
    Err(dblab_common::Error::StateNotFound {
        path: ctx.store.path(),
    }
    .into())
}

/// Requirement: an SSH key is configured in the profile
pub fn require_ssh_key(ctx: &Context) -> Result<()> {
    match &ctx.profile.ssh_key_path {
        Some(_) => Ok(()),
        None => Err(Error::validation(format!(
            "no sshKeyPath in profile {}",
            dblab_common::config::profile_path(&ctx.profile_dir).display()
        ))),
    }
}

/// Post-success action: back up every changed target and persist the hashes.
///
/// Backup problems, including an unreadable `state.json`, are logged and
/// never fail the command that already succeeded.
pub fn backup_after<A>(ctx: &Context, _args: &A) -> Result<()> {
    match ctx.load_state() {
        Ok(mut state) => {
            run_backup(ctx, &mut state);
        }
        Err(e) => warn!(error = %e, "Could not read state, skipping backup"),
    }
    Ok(())
}

/// Back up `state`'s changed targets, saving the state if any hash moved.
///
/// Returns the number of targets uploaded. Failures are logged.
pub fn run_backup(ctx: &Context, state: &mut ClusterState) -> usize {
    let Some(store) = ctx.object_store_for(state) else {
        warn!(cluster = %state.name, "No backup bucket configured, skipping backup");
        return 0;
    };
    if state.bucket.is_none() {
        state.bucket = ctx.profile.bucket.clone();
        save_after_backup(ctx, state);
    }

    let report = backup_changed(state, store.as_ref(), &ctx.work_dir, &default_targets());
    for failure in &report.failed {
        warn!(cluster = %state.name, error = %failure, "Backup incomplete");
    }
    if report.changed() {
        save_after_backup(ctx, state);
    }
    info!(
        cluster = %state.name,
        uploaded = report.uploaded.len(),
        skipped = report.skipped.len(),
        failed = report.failed.len(),
        "Backup finished"
    );
    report.uploaded.len()
}

fn save_after_backup(ctx: &Context, state: &ClusterState) {
    if let Err(e) = ctx.save_state(state) {
        warn!(cluster = %state.name, error = %e, "Could not record backup state");
    }
}
