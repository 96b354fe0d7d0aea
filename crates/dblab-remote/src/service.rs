//! Lifecycle of init-system managed services on remote hosts.
//!
//! [`ServiceLifecycle`] supplies every operation as a default method driving
//! `systemctl` through [`RemoteOperations`]. A service with extra readiness
//! semantics overrides only `start`/`restart` (see [`CassandraService`]).

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use dblab_common::poll::poll_until;
use dblab_common::ClusterHost;

use crate::error::ServiceError;
use crate::gateway::RemoteOperations;
use crate::ssh::shell_quote;

/// Result type for lifecycle operations
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Whether a `systemctl is-active` answer means running
pub fn is_active_status(status: &str) -> bool {
    status.trim().eq_ignore_ascii_case("active")
}

/// start/stop/restart/status for one systemd unit.
pub trait ServiceLifecycle: Send + Sync {
    /// Unit name, e.g. `cassandra`
    fn name(&self) -> &str;

    /// Remote operations used to reach the host
    fn remote(&self) -> &dyn RemoteOperations;

    /// Start the unit
    fn start(&self, host: &ClusterHost) -> ServiceResult<()> {
        systemctl(self, host, "start")
    }

    /// Stop the unit
    fn stop(&self, host: &ClusterHost) -> ServiceResult<()> {
        systemctl(self, host, "stop")
    }

    /// Restart the unit
    fn restart(&self, host: &ClusterHost) -> ServiceResult<()> {
        systemctl(self, host, "restart")
    }

    /// Raw `systemctl is-active` answer, trimmed
    fn get_status(&self, host: &ClusterHost) -> ServiceResult<String> {
        // is-active exits 3 for inactive units; the answer is on stdout either way.
        let command = format!("systemctl is-active {} || true", shell_quote(self.name()));
        let response = self
            .remote()
            .execute_remotely(host, &command, true, false)
            .map_err(|source| ServiceError::Operation {
                service: self.name().to_string(),
                operation: "status".to_string(),
                host: host.alias.clone(),
                source,
            })?;
        Ok(response.stdout.trim().to_string())
    }

    /// Whether the unit reports `active`
    fn is_running(&self, host: &ClusterHost) -> ServiceResult<bool> {
        Ok(is_active_status(&self.get_status(host)?))
    }

    /// Installed software version, when the service can report one
    fn version(&self, _host: &ClusterHost) -> ServiceResult<Option<String>> {
        Ok(None)
    }
}

/// Run `sudo systemctl <verb> <unit>` for `service`
pub fn systemctl<S>(service: &S, host: &ClusterHost, verb: &str) -> ServiceResult<()>
where
    S: ServiceLifecycle + ?Sized,
{
    info!(service = %service.name(), host = %host.alias, "{} service", verb);
    let command = format!("sudo systemctl {} {}", verb, shell_quote(service.name()));
    service
        .remote()
        .execute_remotely(host, &command, false, false)
        .map(|_| ())
        .map_err(|source| ServiceError::Operation {
            service: service.name().to_string(),
            operation: verb.to_string(),
            host: host.alias.clone(),
            source,
        })
}

/// A unit with no readiness semantics beyond systemd's.
pub struct SystemdService {
    name: String,
    remote: Arc<dyn RemoteOperations>,
}

impl SystemdService {
    /// Manage `name` through `remote`
    pub fn new(name: impl Into<String>, remote: Arc<dyn RemoteOperations>) -> Self {
        Self {
            name: name.into(),
            remote,
        }
    }
}

impl ServiceLifecycle for SystemdService {
    fn name(&self) -> &str {
        &self.name
    }

    fn remote(&self) -> &dyn RemoteOperations {
        self.remote.as_ref()
    }
}

/// Default bound on waiting for a node to join the ring
pub const CASSANDRA_READY_TIMEOUT: Duration = Duration::from_secs(600);

/// Default interval between `nodetool status` probes
pub const CASSANDRA_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Cassandra: start and restart block until the node reports Up/Normal.
pub struct CassandraService {
    remote: Arc<dyn RemoteOperations>,
    ready_timeout: Duration,
    poll_interval: Duration,
}

impl CassandraService {
    /// Manage the `cassandra` unit through `remote`
    pub fn new(remote: Arc<dyn RemoteOperations>) -> Self {
        Self {
            remote,
            ready_timeout: CASSANDRA_READY_TIMEOUT,
            poll_interval: CASSANDRA_POLL_INTERVAL,
        }
    }

    /// Override readiness timing
    pub fn with_timing(mut self, ready_timeout: Duration, poll_interval: Duration) -> Self {
        self.ready_timeout = ready_timeout;
        self.poll_interval = poll_interval;
        self
    }

    /// Block until `nodetool status` lists the host's private address as `UN`
    pub fn wait_until_up(&self, host: &ClusterHost) -> ServiceResult<()> {
        poll_until(
            self.ready_timeout,
            self.poll_interval,
            &format!("cassandra on {} to report UN", host.alias),
            || match self
                .remote
                .execute_remotely(host, "nodetool status", true, false)
            {
                Ok(response) => Ok(node_is_up(&response.stdout, &host.private_ip).then_some(())),
                Err(e) => {
                    // nodetool fails until JMX is listening
                    debug!(host = %host.alias, error = %e, "nodetool not ready");
                    Ok(None)
                }
            },
        )
        .map_err(|e| ServiceError::NotReady {
            service: self.name().to_string(),
            host: host.alias.clone(),
            message: e.to_string(),
        })?;
        info!(host = %host.alias, "Cassandra is up");
        Ok(())
    }
}

impl ServiceLifecycle for CassandraService {
    fn name(&self) -> &str {
        "cassandra"
    }

    fn remote(&self) -> &dyn RemoteOperations {
        self.remote.as_ref()
    }

    fn start(&self, host: &ClusterHost) -> ServiceResult<()> {
        systemctl(self, host, "start")?;
        self.wait_until_up(host)
    }

    fn restart(&self, host: &ClusterHost) -> ServiceResult<()> {
        systemctl(self, host, "restart")?;
        self.wait_until_up(host)
    }

    fn version(&self, host: &ClusterHost) -> ServiceResult<Option<String>> {
        let response = self
            .remote
            .execute_remotely(host, "nodetool version", true, false)
            .map_err(|source| ServiceError::Operation {
                service: self.name().to_string(),
                operation: "version".to_string(),
                host: host.alias.clone(),
                source,
            })?;
        Ok(parse_release_version(&response.stdout))
    }
}

/// Whether `nodetool status` output shows `address` as Up/Normal
pub fn node_is_up(status_output: &str, address: &str) -> bool {
    status_output.lines().any(|line| {
        let mut fields = line.split_whitespace();
        fields.next() == Some("UN") && fields.next() == Some(address)
    })
}

/// Extract `5.0.2` from `ReleaseVersion: 5.0.2`
fn parse_release_version(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        line.trim()
            .strip_prefix("ReleaseVersion:")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{MockRemoteOperations, Response};
    use crate::RemoteError;
    use parking_lot::Mutex;

    const NODETOOL_UP: &str = "\
Datacenter: us-west-2
=====================
Status=Up/Down
|/ State=Normal/Leaving/Joining/Moving
--  Address     Load       Tokens  Owns   Host ID   Rack
UN  10.0.1.11   104.3 KiB  4       ?      1a2b      us-west-2a
UJ  10.0.1.12   88.1 KiB   4       ?      3c4d      us-west-2b
";

    fn host() -> ClusterHost {
        ClusterHost::new("54.1.1.1", "10.0.1.11", "db0", "us-west-2a", "i-db0")
    }

    fn respond(stdout: &str) -> crate::Result<Response> {
        Ok(Response {
            stdout: stdout.to_string(),
            stderr: String::new(),
        })
    }

    // ==========================================================================
    // Story: Status mapping
    // ==========================================================================

    #[test]
    fn only_active_counts_as_running() {
        assert!(is_active_status("active"));
        assert!(is_active_status("  Active\n"));
        assert!(is_active_status("ACTIVE"));
        for status in ["inactive", "failed", "", "unknown", "activating"] {
            assert!(!is_active_status(status), "{:?} must not be running", status);
        }
    }

    #[test]
    fn is_running_reads_is_active_output() {
        let mut remote = MockRemoteOperations::new();
        remote
            .expect_execute_remotely()
            .withf(|_, cmd, capture, _| cmd == "systemctl is-active nginx || true" && *capture)
            .times(1)
            .returning(|_, _, _, _| respond("inactive\n"));
        let service = SystemdService::new("nginx", Arc::new(remote));

        assert!(!service.is_running(&host()).unwrap());
    }

    #[test]
    fn when_remote_fails_error_wraps_operation_and_host() {
        let mut remote = MockRemoteOperations::new();
        remote.expect_execute_remotely().returning(|h, _, _, _| {
            Err(RemoteError::Execution {
                host: h.alias.clone(),
                exit_code: Some(5),
                stderr: "Unit nginx.service not found.".to_string(),
            })
        });
        let service = SystemdService::new("nginx", Arc::new(remote));

        let err = service.stop(&host()).unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("stop nginx on db0 failed"), "{}", message);
        assert!(message.contains("not found"));
    }

    // ==========================================================================
    // Story: Cassandra readiness
    // ==========================================================================

    #[test]
    fn node_is_up_matches_exact_address_in_un_state() {
        assert!(node_is_up(NODETOOL_UP, "10.0.1.11"));
        assert!(!node_is_up(NODETOOL_UP, "10.0.1.12"));
        assert!(!node_is_up(NODETOOL_UP, "10.0.1.1"));
        assert!(!node_is_up("", "10.0.1.11"));
    }

    #[test]
    fn when_cassandra_starts_it_waits_for_un() {
        let commands = Arc::new(Mutex::new(Vec::new()));
        let seen = commands.clone();
        let probes = Mutex::new(0);
        let mut remote = MockRemoteOperations::new();
        remote
            .expect_execute_remotely()
            .returning(move |h, cmd, _, _| {
                seen.lock().push(cmd.to_string());
                if cmd != "nodetool status" {
                    return respond("");
                }
                let mut n = probes.lock();
                *n += 1;
                match *n {
                    1 => Err(RemoteError::Execution {
                        host: h.alias.clone(),
                        exit_code: Some(1),
                        stderr: "Failed to connect to '127.0.0.1:7199'".to_string(),
                    }),
                    2 => respond(&NODETOOL_UP.replace("UN  10.0.1.11", "UJ  10.0.1.11")),
                    _ => respond(NODETOOL_UP),
                }
            });
        let service = CassandraService::new(Arc::new(remote))
            .with_timing(Duration::from_secs(5), Duration::from_millis(1));

        service.start(&host()).unwrap();

        let commands = commands.lock();
        assert_eq!(commands[0], "sudo systemctl start cassandra");
        assert_eq!(commands.len(), 4);
    }

    #[test]
    fn when_cassandra_never_joins_start_reports_not_ready() {
        let mut remote = MockRemoteOperations::new();
        remote
            .expect_execute_remotely()
            .returning(|_, cmd, _, _| {
                if cmd == "nodetool status" {
                    respond("UJ  10.0.1.11  1 KiB  4  ?  x  r")
                } else {
                    respond("")
                }
            });
        let service = CassandraService::new(Arc::new(remote))
            .with_timing(Duration::from_millis(20), Duration::from_millis(5));

        let err = service.restart(&host()).unwrap_err();
        assert!(matches!(err, ServiceError::NotReady { .. }));
    }

    #[test]
    fn cassandra_reports_release_version() {
        let mut remote = MockRemoteOperations::new();
        remote
            .expect_execute_remotely()
            .returning(|_, _, _, _| respond("ReleaseVersion: 5.0.2\n"));
        let service = CassandraService::new(Arc::new(remote));

        assert_eq!(service.version(&host()).unwrap(), Some("5.0.2".to_string()));
        assert!(service.is_running(&host()).is_ok());
    }
}
