//! Generated `sshConfig` and `env.sh` for the working directory.

use std::fmt::Write as _;
use std::path::Path;

use tracing::debug;

use dblab_common::config::UserConfig;
use dblab_common::state::atomic_write;
use dblab_common::{ClusterState, Role, CQL_PORT};

use crate::Result;

/// File name of the generated SSH client config
pub const SSH_CONFIG_FILE: &str = "sshConfig";

/// File name of the generated shell environment
pub const ENV_FILE: &str = "env.sh";

/// One `Host` block per cluster host, keyed by alias
pub fn render_ssh_config(state: &ClusterState, profile: &UserConfig) -> String {
    let mut out = String::new();
    for host in state.hosts.values().flatten() {
        let _ = writeln!(out, "Host {}", host.alias);
        let _ = writeln!(out, "  HostName {}", host.public_ip);
        let _ = writeln!(out, "  User {}", profile.ssh_user);
        if let Some(key) = &profile.ssh_key_path {
            let _ = writeln!(out, "  IdentityFile {}", key.display());
        }
        out.push_str("  StrictHostKeyChecking no\n");
        out.push_str("  UserKnownHostsFile /dev/null\n\n");
    }
    out
}

/// Shell exports describing the cluster
pub fn render_env(state: &ClusterState, work_dir: &Path) -> String {
    let mut out = String::from("#!/usr/bin/env bash\n");
    let ssh_config = work_dir.join(SSH_CONFIG_FILE);

    let _ = writeln!(out, "export DBLAB_CLUSTER_NAME={}", state.name);
    let _ = writeln!(out, "export DBLAB_CLUSTER_ID={}", state.cluster_id);
    let _ = writeln!(out, "export DBLAB_SSH_CONFIG=\"{}\"", ssh_config.display());

    for role in Role::ALL {
        let hosts = state.hosts_for(role);
        if hosts.is_empty() {
            continue;
        }
        let prefix = role.alias_prefix().to_ascii_uppercase();
        for host in hosts {
            let _ = writeln!(out, "export {}_IP={}", host.alias.to_ascii_uppercase(), host.public_ip);
        }
        let private: Vec<&str> = hosts.iter().map(|h| h.private_ip.as_str()).collect();
        let _ = writeln!(out, "export {}_PRIVATE_IPS={}", prefix, private.join(","));
    }

    if let Some(seed) = state.hosts_for(Role::Database).first() {
        let _ = writeln!(out, "export CASSANDRA_CONTACT_POINT={}:{}", seed.private_ip, CQL_PORT);
    }
    if let Some(dns) = state.add_ons.spark.as_ref().and_then(|s| s.master_dns.as_ref()) {
        let _ = writeln!(out, "export SPARK_MASTER_DNS={}", dns);
    }
    if let Some(endpoint) = state
        .add_ons
        .opensearch
        .as_ref()
        .and_then(|o| o.endpoint.as_ref())
    {
        let _ = writeln!(out, "export OPENSEARCH_ENDPOINT=https://{}", endpoint);
    }

    let _ = writeln!(out, "alias ssh='ssh -F \"$DBLAB_SSH_CONFIG\"'");
    let _ = writeln!(out, "alias scp='scp -F \"$DBLAB_SSH_CONFIG\"'");
    out
}

/// Write both files into `work_dir`
pub fn write_host_files(state: &ClusterState, profile: &UserConfig, work_dir: &Path) -> Result<()> {
    atomic_write(&work_dir.join(SSH_CONFIG_FILE), &render_ssh_config(state, profile))?;
    atomic_write(&work_dir.join(ENV_FILE), &render_env(state, work_dir))?;
    debug!(cluster = %state.name, "Wrote sshConfig and env.sh");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::lab_state;
    use dblab_common::types::OpenSearchState;
    use std::path::PathBuf;

    #[test]
    fn ssh_config_has_a_block_per_host() {
        let profile = UserConfig {
            ssh_key_path: Some(PathBuf::from("/home/me/.dblab/secret.pem")),
            ..Default::default()
        };
        let config = render_ssh_config(&lab_state(), &profile);

        assert_eq!(config.matches("Host db").count(), 3);
        assert!(config.contains("Host db1\n  HostName 54.0.0.1\n  User ubuntu\n"));
        assert!(config.contains("IdentityFile /home/me/.dblab/secret.pem"));
    }

    #[test]
    fn ssh_config_without_key_omits_identity() {
        let config = render_ssh_config(&lab_state(), &UserConfig::default());
        assert!(!config.contains("IdentityFile"));
    }

    #[test]
    fn env_exports_hosts_and_contact_point() {
        let mut state = lab_state();
        state.add_ons.opensearch = Some(OpenSearchState {
            domain_name: "lab-abc".to_string(),
            endpoint: Some("search-lab.es.amazonaws.com".to_string()),
            active: true,
        });
        let env = render_env(&state, Path::new("/work/lab"));

        assert!(env.contains("export DBLAB_CLUSTER_NAME=lab\n"));
        assert!(env.contains("export DB0_IP=54.0.0.0\n"));
        assert!(env.contains("export DB_PRIVATE_IPS=10.0.0.0,10.0.0.1,10.0.0.2\n"));
        assert!(env.contains("export CASSANDRA_CONTACT_POINT=10.0.0.0:9042\n"));
        assert!(env.contains("export OPENSEARCH_ENDPOINT=https://search-lab.es.amazonaws.com\n"));
        assert!(env.contains("/work/lab/sshConfig"));
        assert!(!env.contains("STRESS_PRIVATE_IPS"));
    }

    #[test]
    fn files_land_in_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        write_host_files(&lab_state(), &UserConfig::default(), dir.path()).unwrap();

        assert!(dir.path().join(SSH_CONFIG_FILE).is_file());
        assert!(dir.path().join(ENV_FILE).is_file());
    }
}
