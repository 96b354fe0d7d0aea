//! Remote operation gateway: command execution and file transfer on cluster
//! hosts, plus role-grouped host iteration.
//!
//! ## Host iteration
//!
//! [`with_hosts`] runs an action against the hosts of one role:
//!
//! - [`HostIteration::Sequential`] visits hosts in list order and stops at the
//!   first failure, returning it.
//! - [`HostIteration::Parallel`] starts one thread per host and always waits
//!   for every host. What happens to failures is the caller's explicit choice
//!   via [`ParallelFailure`]: aggregate them into an error, or log them as
//!   warnings.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;

#[cfg(test)]
use mockall::automock;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use dblab_common::{ClusterHost, HostMap, Role};

use crate::filter::TransferFilter;
use crate::ssh::{shell_quote, SshTransport};
use crate::{RemoteError, Result};

/// Placeholder logged instead of secret commands
const REDACTED_COMMAND: &str = "<secret command redacted>";

/// Output of a successful remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    /// Standard output (empty when output was not captured)
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

/// Command execution and file transfer against individual hosts.
#[cfg_attr(test, automock)]
pub trait RemoteOperations: Send + Sync {
    /// Run `command` on `host`.
    ///
    /// With `capture_output == false` stdout is logged line by line instead of
    /// returned. `secret` commands are never logged verbatim. A non-zero exit
    /// is a [`RemoteError::Execution`] carrying stderr.
    fn execute_remotely(
        &self,
        host: &ClusterHost,
        command: &str,
        capture_output: bool,
        secret: bool,
    ) -> Result<Response>;

    /// Upload one file
    fn upload(&self, host: &ClusterHost, local: &Path, remote: &str) -> Result<()>;

    /// Download one file
    fn download(&self, host: &ClusterHost, remote: &str, local: &Path) -> Result<()>;

    /// Upload a directory tree, returning the number of files sent
    fn upload_directory(
        &self,
        host: &ClusterHost,
        local: &Path,
        remote: &str,
        filter: &TransferFilter,
    ) -> Result<usize>;

    /// Download a directory tree, returning the number of files received
    fn download_directory(
        &self,
        host: &ClusterHost,
        remote: &str,
        local: &Path,
        filter: &TransferFilter,
    ) -> Result<usize>;
}

/// [`RemoteOperations`] over an [`SshTransport`], addressing hosts by public IP.
#[derive(Clone)]
pub struct SshRemoteOperations {
    transport: Arc<dyn SshTransport>,
}

impl SshRemoteOperations {
    /// Create operations over a transport
    pub fn new(transport: Arc<dyn SshTransport>) -> Self {
        Self { transport }
    }
}

impl RemoteOperations for SshRemoteOperations {
    fn execute_remotely(
        &self,
        host: &ClusterHost,
        command: &str,
        capture_output: bool,
        secret: bool,
    ) -> Result<Response> {
        let logged = if secret { REDACTED_COMMAND } else { command };
        debug!(host = %host.alias, command = %logged, "Executing remote command");

        let output = self
            .transport
            .exec(&host.public_ip, command)
            .map_err(|e| match e {
                RemoteError::Transport { message, .. } => {
                    RemoteError::transport(&host.alias, message)
                }
                other => other,
            })?;

        if !output.success() {
            warn!(
                host = %host.alias,
                command = %logged,
                exit_code = ?output.exit_code,
                "Remote command failed"
            );
            return Err(RemoteError::Execution {
                host: host.alias.clone(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        if capture_output {
            return Ok(Response {
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }

        for line in output.stdout.lines() {
            info!(host = %host.alias, "{}", line);
        }
        Ok(Response {
            stdout: String::new(),
            stderr: output.stderr,
        })
    }

    fn upload(&self, host: &ClusterHost, local: &Path, remote: &str) -> Result<()> {
        debug!(host = %host.alias, local = %local.display(), remote = %remote, "Uploading file");
        self.transport.copy_to(&host.public_ip, local, remote)
    }

    fn download(&self, host: &ClusterHost, remote: &str, local: &Path) -> Result<()> {
        debug!(host = %host.alias, remote = %remote, local = %local.display(), "Downloading file");
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| RemoteError::io(format!("failed to create {}", parent.display()), e))?;
        }
        self.transport.copy_from(&host.public_ip, remote, local)
    }

    fn upload_directory(
        &self,
        host: &ClusterHost,
        local: &Path,
        remote: &str,
        filter: &TransferFilter,
    ) -> Result<usize> {
        let files = local_files(local, filter)?;
        let remote = remote.trim_end_matches('/');

        let mut dirs = BTreeSet::new();
        dirs.insert(remote.to_string());
        for relative in &files {
            if let Some((parent, _)) = relative.rsplit_once('/') {
                dirs.insert(format!("{}/{}", remote, parent));
            }
        }
        let mkdir = format!(
            "mkdir -p {}",
            dirs.iter().map(|d| shell_quote(d)).collect::<Vec<_>>().join(" ")
        );
        self.execute_remotely(host, &mkdir, true, false)?;

        for relative in &files {
            self.upload(host, &local.join(relative), &format!("{}/{}", remote, relative))?;
        }
        info!(host = %host.alias, files = files.len(), remote = %remote, "Uploaded directory");
        Ok(files.len())
    }

    fn download_directory(
        &self,
        host: &ClusterHost,
        remote: &str,
        local: &Path,
        filter: &TransferFilter,
    ) -> Result<usize> {
        let remote = remote.trim_end_matches('/');
        let listing = self.execute_remotely(
            host,
            &format!("find {} -type f", shell_quote(remote)),
            true,
            false,
        )?;

        let prefix = format!("{}/", remote);
        let files: Vec<&str> = listing
            .stdout
            .lines()
            .filter_map(|line| line.trim().strip_prefix(&prefix))
            .filter(|relative| filter.accepts(relative))
            .collect();

        for relative in &files {
            self.download(host, &format!("{}/{}", remote, relative), &local.join(relative))?;
        }
        info!(host = %host.alias, files = files.len(), remote = %remote, "Downloaded directory");
        Ok(files.len())
    }
}

/// Relative (`/`-separated) paths of the files under `root` accepted by `filter`
fn local_files(root: &Path, filter: &TransferFilter) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            RemoteError::io(
                format!("failed to walk {}", root.display()),
                std::io::Error::other(e.to_string()),
            )
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if filter.accepts(&relative) {
            files.push(relative);
        }
    }
    Ok(files)
}

/// Which hosts of a role an operation targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostFilter {
    aliases: Vec<String>,
}

impl HostFilter {
    /// Every host of the role
    pub fn all() -> Self {
        Self::default()
    }

    /// Only hosts with these aliases; an empty list means every host
    pub fn aliases<I, S>(aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            aliases: aliases.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a comma-separated alias list (`db0,db2`)
    pub fn parse(list: &str) -> Self {
        Self::aliases(list.split(',').map(str::trim).filter(|s| !s.is_empty()))
    }

    /// Whether a host passes the filter
    pub fn matches(&self, host: &ClusterHost) -> bool {
        self.aliases.is_empty() || self.aliases.iter().any(|a| a == &host.alias)
    }
}

/// How [`with_hosts`] visits hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostIteration {
    /// One host at a time in list order; the first failure aborts the rest
    Sequential,
    /// One thread per host; every host runs regardless of failures
    Parallel(ParallelFailure),
}

/// What a parallel iteration does with per-host failures once all hosts ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelFailure {
    /// Return [`RemoteError::HostsFailed`] listing every failed host
    Propagate,
    /// Log each failure as a warning and succeed
    Warn,
}

/// Run `action` against the filtered hosts of `role`.
///
/// The action may use any error type that can absorb a [`RemoteError`]; the
/// parallel aggregate is reported as [`RemoteError::HostsFailed`] converted
/// into that type.
pub fn with_hosts<F, E>(
    hosts: &HostMap,
    role: Role,
    filter: &HostFilter,
    iteration: HostIteration,
    action: F,
) -> std::result::Result<(), E>
where
    F: Fn(&ClusterHost) -> std::result::Result<(), E> + Sync,
    E: From<RemoteError> + fmt::Display + Send,
{
    let targets: Vec<&ClusterHost> = hosts
        .get(&role)
        .map(|list| list.iter().filter(|h| filter.matches(h)).collect())
        .unwrap_or_default();

    if targets.is_empty() {
        debug!(role = %role, "No hosts matched");
        return Ok(());
    }

    match iteration {
        HostIteration::Sequential => {
            for host in targets {
                action(host)?;
            }
            Ok(())
        }
        HostIteration::Parallel(on_failure) => {
            let action = &action;
            let results: Vec<(String, std::result::Result<(), E>)> = thread::scope(|scope| {
                let handles: Vec<_> = targets
                    .iter()
                    .map(|host| (host.alias.clone(), scope.spawn(move || action(host))))
                    .collect();
                handles
                    .into_iter()
                    .map(|(alias, handle)| {
                        let result = handle.join().unwrap_or_else(|_| {
                            Err(RemoteError::transport(&alias, "host action panicked").into())
                        });
                        (alias, result)
                    })
                    .collect()
            });

            let failures: Vec<(String, String)> = results
                .into_iter()
                .filter_map(|(alias, result)| result.err().map(|e| (alias, e.to_string())))
                .collect();

            if failures.is_empty() {
                return Ok(());
            }
            match on_failure {
                ParallelFailure::Propagate => Err(RemoteError::HostsFailed { failures }.into()),
                ParallelFailure::Warn => {
                    for (alias, message) in &failures {
                        warn!(role = %role, host = %alias, error = %message, "Host operation failed");
                    }
                    Ok(())
                }
            }
        }
    }
}
