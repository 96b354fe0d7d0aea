//! `dblab exec`: run a shell command on cluster hosts.

use clap::Args;
use tracing::info;

use dblab_remote::ssh::shell_quote;
use dblab_remote::with_hosts;

use crate::commands::{require_ssh_key, require_state, HostArgs};
use crate::context::Context;
use crate::pipeline::CommandSpec;
use crate::queue::QueueHandle;
use crate::{Commands, Error, Result};

/// Run a command on every host of a role
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct ExecArgs {
    #[command(flatten)]
    pub target: HostArgs,

    /// Do not log the command line (it contains credentials)
    #[arg(long)]
    pub secret: bool,

    /// Command to run. A single argument is passed to the remote shell as is;
    /// several arguments are quoted one by one
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

pub fn spec() -> CommandSpec<ExecArgs> {
    CommandSpec::new("exec", execute)
        .require(require_state)
        .require(require_ssh_key)
}

fn execute(ctx: &Context, args: &ExecArgs, _queue: &QueueHandle<Commands>) -> Result<()> {
    if args.command.is_empty() {
        return Err(Error::validation("no command given"));
    }
    let state = ctx.load_state()?;
    args.target.ensure_targets(&state)?;

    let command = command_line(&args.command);
    let remote = ctx.factory.remote();
    with_hosts(
        &state.hosts,
        args.target.role,
        &args.target.filter(),
        args.target.iteration(),
        |host| -> Result<()> {
            info!(host = %host.alias, "Running command");
            remote.execute_remotely(host, &command, false, args.secret)?;
            Ok(())
        },
    )
}

/// Build the remote shell line from the trailing arguments
fn command_line(words: &[String]) -> String {
    match words {
        [line] => line.clone(),
        _ => words
            .iter()
            .map(|word| shell_quote(word))
            .collect::<Vec<_>>()
            .join(" "),
    }
}
