//! SSH transport backed by the system `ssh` and `scp` clients.
//!
//! Every connection uses key authentication in batch mode, so a missing key or
//! an unreachable host fails fast instead of prompting. Port forwards are
//! long-lived `ssh -N` child processes owned by a [`ForwardChannel`].

use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

#[cfg(test)]
use mockall::automock;
use tracing::{debug, info, warn};

use dblab_common::poll::poll_until;

use crate::{RemoteError, Result};

/// ssh exits with 255 when the connection itself failed
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Interval between local port readiness probes
const PORT_PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// Connection settings shared by every SSH call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfig {
    /// Login user on remote hosts
    pub user: String,
    /// Private key, `None` to rely on the agent/default identities
    pub key_path: Option<PathBuf>,
    /// Remote SSH port
    pub port: u16,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// How long a new forward may take to accept local connections
    pub forward_ready_timeout: Duration,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "ubuntu".to_string(),
            key_path: None,
            port: dblab_common::DEFAULT_SSH_PORT,
            connect_timeout: Duration::from_secs(10),
            forward_ready_timeout: Duration::from_secs(30),
        }
    }
}

/// Raw result of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if the process was killed by a signal
    pub exit_code: Option<i32>,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited zero
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// What a forward channel exposes locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardSpec {
    /// `-L`: one local port to one destination reachable from the gateway
    Local {
        /// Local listening port
        local_port: u16,
        /// Destination host as seen from the gateway
        remote_host: String,
        /// Destination port
        remote_port: u16,
    },
    /// `-D`: SOCKS5 proxy to anything reachable from the gateway
    Dynamic {
        /// Local listening port
        local_port: u16,
    },
}

impl ForwardSpec {
    /// Local listening port
    pub fn local_port(&self) -> u16 {
        match self {
            ForwardSpec::Local { local_port, .. } | ForwardSpec::Dynamic { local_port } => {
                *local_port
            }
        }
    }

    /// Human-readable destination for logs and errors
    pub fn destination(&self) -> String {
        match self {
            ForwardSpec::Local {
                remote_host,
                remote_port,
                ..
            } => format!("{}:{}", remote_host, remote_port),
            ForwardSpec::Dynamic { .. } => "socks".to_string(),
        }
    }
}

/// A live forward through a gateway host.
pub trait ForwardChannel: Send {
    /// Local listening port
    fn local_port(&self) -> u16;

    /// Whether the underlying session is still up
    fn is_alive(&mut self) -> bool;

    /// Tear the channel down. Calling it again is a no-op.
    fn close(&mut self) -> Result<()>;
}

/// Low-level SSH operations against one host at a time.
#[cfg_attr(test, automock)]
pub trait SshTransport: Send + Sync {
    /// Run `command` through the remote shell and capture its output
    fn exec(&self, host: &str, command: &str) -> Result<CommandOutput>;

    /// Copy a local file to `remote`
    fn copy_to(&self, host: &str, local: &Path, remote: &str) -> Result<()>;

    /// Copy `remote` to a local file
    fn copy_from(&self, host: &str, remote: &str, local: &Path) -> Result<()>;

    /// Open a forward through `gateway`, ready to accept local connections
    fn open_forward(&self, gateway: &str, spec: &ForwardSpec) -> Result<Box<dyn ForwardChannel>>;
}

/// [`SshTransport`] driving the OpenSSH command-line clients.
#[derive(Debug, Clone)]
pub struct OpenSsh {
    config: SshConfig,
}

impl OpenSsh {
    /// Create a transport with the given settings
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// Connection settings
    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    /// Options shared by ssh and scp
    fn common_options(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(key) = &self.config.key_path {
            args.push("-i".to_string());
            args.push(key.to_string_lossy().into_owned());
        }
        for option in [
            "StrictHostKeyChecking=no".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "LogLevel=ERROR".to_string(),
            "BatchMode=yes".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout.as_secs().max(1)),
        ] {
            args.push("-o".to_string());
            args.push(option);
        }
        args
    }

    fn target(&self, host: &str) -> String {
        format!("{}@{}", self.config.user, host)
    }

    /// Arguments for `ssh <host> <command>`
    pub fn exec_args(&self, host: &str, command: &str) -> Vec<String> {
        let mut args = self.common_options();
        args.push("-p".to_string());
        args.push(self.config.port.to_string());
        args.push(self.target(host));
        args.push(command.to_string());
        args
    }

    /// Arguments for `scp` in either direction
    pub fn scp_args(&self, from: &str, to: &str) -> Vec<String> {
        let mut args = self.common_options();
        args.push("-q".to_string());
        args.push("-P".to_string());
        args.push(self.config.port.to_string());
        args.push(from.to_string());
        args.push(to.to_string());
        args
    }

    /// Arguments for a background `ssh -N` forward
    pub fn forward_args(&self, gateway: &str, spec: &ForwardSpec) -> Vec<String> {
        let mut args = self.common_options();
        args.extend(
            [
                "-N",
                "-o",
                "ExitOnForwardFailure=yes",
                "-o",
                "ServerAliveInterval=30",
                "-o",
                "ServerAliveCountMax=3",
            ]
            .map(String::from),
        );
        match spec {
            ForwardSpec::Local {
                local_port,
                remote_host,
                remote_port,
            } => {
                args.push("-L".to_string());
                args.push(format!("127.0.0.1:{}:{}:{}", local_port, remote_host, remote_port));
            }
            ForwardSpec::Dynamic { local_port } => {
                args.push("-D".to_string());
                args.push(format!("127.0.0.1:{}", local_port));
            }
        }
        args.push("-p".to_string());
        args.push(self.config.port.to_string());
        args.push(self.target(gateway));
        args
    }

    fn run_scp(&self, host: &str, from: &str, to: &str) -> Result<()> {
        let output = Command::new("scp")
            .args(self.scp_args(from, to))
            .stdin(Stdio::null())
            .output()
            .map_err(|e| RemoteError::transport(host, format!("failed to run scp: {}", e)))?;
        if !output.status.success() {
            return Err(RemoteError::transport(
                host,
                format!(
                    "scp {} -> {} failed: {}",
                    from,
                    to,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(())
    }
}

impl SshTransport for OpenSsh {
    fn exec(&self, host: &str, command: &str) -> Result<CommandOutput> {
        let output = Command::new("ssh")
            .args(self.exec_args(host, command))
            .stdin(Stdio::null())
            .output()
            .map_err(|e| RemoteError::transport(host, format!("failed to run ssh: {}", e)))?;

        let exit_code = output.status.code();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if exit_code == Some(SSH_CONNECTION_FAILURE) {
            return Err(RemoteError::transport(host, stderr.trim().to_string()));
        }

        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
        })
    }

    fn copy_to(&self, host: &str, local: &Path, remote: &str) -> Result<()> {
        self.run_scp(
            host,
            &local.to_string_lossy(),
            &format!("{}:{}", self.target(host), remote),
        )
    }

    fn copy_from(&self, host: &str, remote: &str, local: &Path) -> Result<()> {
        self.run_scp(
            host,
            &format!("{}:{}", self.target(host), remote),
            &local.to_string_lossy(),
        )
    }

    fn open_forward(&self, gateway: &str, spec: &ForwardSpec) -> Result<Box<dyn ForwardChannel>> {
        let destination = spec.destination();
        let local_port = spec.local_port();

        let mut child = Command::new("ssh")
            .args(self.forward_args(gateway, spec))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                RemoteError::tunnel(gateway, &destination, format!("failed to spawn ssh: {}", e))
            })?;

        let ready = poll_until(
            self.config.forward_ready_timeout,
            PORT_PROBE_INTERVAL,
            &format!("forward on 127.0.0.1:{}", local_port),
            || {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(format!("ssh exited with {}", status));
                }
                Ok(port_accepts_connections(local_port).then_some(()))
            },
        );

        if let Err(e) = ready {
            let _ = child.kill();
            let _ = child.wait();
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr);
            }
            let message = if stderr.trim().is_empty() {
                e.to_string()
            } else {
                format!("{} ({})", e, stderr.trim())
            };
            return Err(RemoteError::tunnel(gateway, destination, message));
        }

        info!(gateway = %gateway, destination = %destination, local_port, "Forward established");
        Ok(Box::new(SshForward {
            child: Some(child),
            local_port,
        }))
    }
}

/// A forward owned by an `ssh -N` child process.
struct SshForward {
    child: Option<Child>,
    local_port: u16,
}

impl ForwardChannel for SshForward {
    fn local_port(&self) -> u16 {
        self.local_port
    }

    fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn close(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        debug!(local_port = self.local_port, "Closing forward");
        if let Err(e) = child.kill() {
            // Already exited; reap it below.
            debug!(error = %e, "Forward process already gone");
        }
        child
            .wait()
            .map_err(|e| RemoteError::io(format!("failed to reap forward on port {}", self.local_port), e))?;
        Ok(())
    }
}

impl Drop for SshForward {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to close forward on drop");
        }
    }
}

/// Ask the OS for a free local port
pub fn free_local_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .map_err(|e| RemoteError::io("failed to bind an ephemeral port", e))?;
    listener
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|e| RemoteError::io("failed to read ephemeral port", e))
}

/// Whether something accepts TCP connections on `127.0.0.1:port`
pub fn port_accepts_connections(port: u16) -> bool {
    TcpStream::connect_timeout(
        &std::net::SocketAddr::from(([127, 0, 0, 1], port)),
        Duration::from_millis(200),
    )
    .is_ok()
}

/// Quote a string for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}
