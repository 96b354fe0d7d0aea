//! dblab CLI library

pub mod commands;
pub mod context;
pub mod error;
pub mod pipeline;
pub mod queue;

pub use error::{Error, Result};

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use commands::backup::{BackupArgs, RestoreArgs};
use commands::down::DownArgs;
use commands::exec::ExecArgs;
use commands::init::InitArgs;
use commands::proxy::ProxyArgs;
use commands::reconstruct::ReconstructArgs;
use commands::service::ServiceArgs;
use commands::status::StatusArgs;
use commands::tunnel::TunnelArgs;
use commands::up::UpArgs;
use context::Context;
use pipeline::run_pipeline;
use queue::{QueueHandle, WorkQueue};

/// dblab - short-lived database test clusters
#[derive(Parser, Debug)]
#[command(name = "dblab")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Profile directory (default: $DBLAB_PROFILE_DIR, then ~/.dblab)
    #[arg(long, global = true)]
    pub profile_dir: Option<PathBuf>,

    /// Working directory holding state.json
    #[arg(long, short = 'C', global = true, default_value = ".")]
    pub dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Create a cluster definition in the working directory
    Init(InitArgs),
    /// Provision missing hosts and add-ons
    Up(UpArgs),
    /// Terminate the cluster's instances
    Down(DownArgs),
    /// Show hosts, add-ons and versions
    Status(StatusArgs),
    /// Run a command on cluster hosts
    Exec(ExecArgs),
    /// Manage a systemd service on cluster hosts
    Service(ServiceArgs),
    /// Forward a local port into the cluster network
    Tunnel(TunnelArgs),
    /// Run a SOCKS5 proxy into the cluster network
    Proxy(ProxyArgs),
    /// Back up changed working-directory files
    Backup(BackupArgs),
    /// Restore working-directory files from backup
    Restore(RestoreArgs),
    /// Rebuild state.json from cloud tags
    Reconstruct(ReconstructArgs),
}

impl Cli {
    /// Run the CLI command and any follow-ups it schedules
    pub fn run(self) -> Result<()> {
        let ctx = Context::from_flags(&self.dir, self.profile_dir.as_deref())?;
        let result = WorkQueue::starting_with(self.command)
            .drain(|command, queue| dispatch(&ctx, command, queue));
        ctx.resources.close_all();
        result
    }
}

/// Run one command through its pipeline
pub fn dispatch(ctx: &Context, command: Commands, queue: &QueueHandle<Commands>) -> Result<()> {
    match command {
        Commands::Init(args) => run_pipeline(ctx, &commands::init::spec(), &args, queue),
        Commands::Up(args) => run_pipeline(ctx, &commands::up::spec(), &args, queue),
        Commands::Down(args) => run_pipeline(ctx, &commands::down::spec(), &args, queue),
        Commands::Status(args) => run_pipeline(ctx, &commands::status::spec(), &args, queue),
        Commands::Exec(args) => run_pipeline(ctx, &commands::exec::spec(), &args, queue),
        Commands::Service(args) => run_pipeline(ctx, &commands::service::spec(), &args, queue),
        Commands::Tunnel(args) => run_pipeline(ctx, &commands::tunnel::spec(), &args, queue),
        Commands::Proxy(args) => run_pipeline(ctx, &commands::proxy::spec(), &args, queue),
        Commands::Backup(args) => run_pipeline(ctx, &commands::backup::backup_spec(), &args, queue),
        Commands::Restore(args) => {
            run_pipeline(ctx, &commands::backup::restore_spec(), &args, queue)
        }
        Commands::Reconstruct(args) => {
            run_pipeline(ctx, &commands::reconstruct::spec(), &args, queue)
        }
    }
}
