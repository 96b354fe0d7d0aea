//! Rebuild cluster state from cloud resource tags.
//!
//! When `state.json` is lost, the cluster can be recovered from its network
//! resource alone: the network carries the `ClusterId` tag, and every other
//! resource (instances, subnets, bucket) is tagged with the same id. Only the
//! missing `ClusterId` tag is fatal; every other lookup degrades its own field.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::state::ClusterState;
use crate::types::{ClusterHost, HostMap, Infrastructure, Role};
use crate::{Error, Result};

/// Tag carrying the cluster identifier on every resource
pub const CLUSTER_ID_TAG: &str = "ClusterId";
/// Tag carrying the human cluster name on the network resource
pub const CLUSTER_NAME_TAG: &str = "ClusterName";
/// Tag carrying the role on instances
pub const ROLE_TAG: &str = "Role";
/// Tag carrying the role-scoped alias on instances
pub const ALIAS_TAG: &str = "Alias";

/// An instance found by tag, before it is grouped by role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedInstance {
    /// Value of the `Role` tag
    pub role_tag: String,
    /// Host record built from the instance description
    pub host: ClusterHost,
    /// Whether the instance is in the `running` state
    pub running: bool,
    /// When the instance was launched, if known
    pub launch_time: Option<DateTime<Utc>>,
}

impl TaggedInstance {
    /// Running instances win over stopped ones, then newer over older
    fn preference(&self) -> (bool, Option<DateTime<Utc>>) {
        (self.running, self.launch_time)
    }
}

/// Read-only queries against cloud metadata.
#[cfg_attr(test, mockall::automock)]
pub trait ClusterDiscovery: Send + Sync {
    /// Tags on a network resource
    fn network_tags(&self, network_id: &str) -> Result<BTreeMap<String, String>>;

    /// Live instances tagged with the cluster id
    fn cluster_instances(&self, cluster_id: &str) -> Result<Vec<TaggedInstance>>;

    /// Subnets, security group and gateway inside the network
    fn network_resources(&self, network_id: &str) -> Result<Infrastructure>;

    /// Bucket tagged with the cluster id, if one exists
    fn cluster_bucket(&self, cluster_id: &str) -> Result<Option<String>>;
}

/// Rebuild a [`ClusterState`] starting from a tagged network resource.
pub fn reconstruct_from_tag(discovery: &dyn ClusterDiscovery, network_id: &str) -> Result<ClusterState> {
    let tags = discovery
        .network_tags(network_id)
        .map_err(|e| Error::reconstruction(network_id, format!("failed to read tags: {}", e)))?;

    let cluster_id = tags
        .get(CLUSTER_ID_TAG)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| Error::reconstruction(network_id, format!("missing {} tag", CLUSTER_ID_TAG)))?;

    let name = tags
        .get(CLUSTER_NAME_TAG)
        .cloned()
        .unwrap_or_else(|| cluster_id.clone());

    info!(cluster = %name, cluster_id = %cluster_id, network = %network_id, "Reconstructing cluster state");

    let hosts = match discovery.cluster_instances(&cluster_id) {
        Ok(instances) => group_by_role(instances),
        Err(e) => {
            warn!(error = %e, "Failed to discover instances, continuing without hosts");
            HostMap::new()
        }
    };

    let infrastructure = discovery.network_resources(network_id).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to discover network resources");
        Infrastructure::default()
    });

    let bucket = match discovery.cluster_bucket(&cluster_id) {
        Ok(bucket) => bucket,
        Err(e) => {
            warn!(error = %e, "Failed to discover bucket");
            None
        }
    };
    if bucket.is_none() {
        warn!(cluster_id = %cluster_id, "No bucket found for cluster; backups are disabled until one is set");
    }

    Ok(ClusterState {
        name,
        cluster_id,
        network_id: Some(network_id.to_string()),
        hosts,
        infrastructure,
        bucket,
        ..Default::default()
    })
}

/// Group instances by their role tag, ordered by alias index.
///
/// Instances with an unknown role tag are skipped. When several instances
/// carry the same alias only one is kept: a running one if any, else the
/// most recently launched.
fn group_by_role(instances: Vec<TaggedInstance>) -> HostMap {
    let mut chosen: BTreeMap<(Role, String), TaggedInstance> = BTreeMap::new();
    for instance in instances {
        let Ok(role) = instance.role_tag.parse::<Role>() else {
            warn!(
                instance = %instance.host.instance_id,
                role = %instance.role_tag,
                "Skipping instance with unknown role tag"
            );
            continue;
        };
        match chosen.entry((role, instance.host.alias.clone())) {
            Entry::Vacant(slot) => {
                slot.insert(instance);
            }
            Entry::Occupied(mut slot) => {
                let dropped = if instance.preference() > slot.get().preference() {
                    slot.insert(instance)
                } else {
                    instance
                };
                warn!(
                    alias = %dropped.host.alias,
                    kept = %slot.get().host.instance_id,
                    ignored = %dropped.host.instance_id,
                    "Several instances share an alias"
                );
            }
        }
    }

    let mut hosts = HostMap::new();
    for ((role, _), instance) in chosen {
        hosts.entry(role).or_insert_with(Vec::new).push(instance.host);
    }
    for list in hosts.values_mut() {
        list.sort_by_key(|h| alias_index(&h.alias));
    }
    hosts
}

fn alias_index(alias: &str) -> (usize, String) {
    let digits: String = alias.chars().rev().take_while(char::is_ascii_digit).collect();
    let index = digits.chars().rev().collect::<String>().parse().unwrap_or(usize::MAX);
    (index, alias.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn instance(role: &str, alias: &str) -> TaggedInstance {
        TaggedInstance {
            role_tag: role.to_string(),
            host: ClusterHost::new("1.2.3.4", "10.0.0.4", alias, "us-west-2a", format!("i-{}", alias)),
            running: true,
            launch_time: None,
        }
    }

    fn launched(alias: &str, id: &str, running: bool, hour: u32) -> TaggedInstance {
        TaggedInstance {
            role_tag: "database".to_string(),
            host: ClusterHost::new("1.2.3.4", "10.0.0.4", alias, "us-west-2a", id),
            running,
            launch_time: Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single(),
        }
    }

    fn discovery_with_tags() -> MockClusterDiscovery {
        let mut discovery = MockClusterDiscovery::new();
        discovery
            .expect_network_tags()
            .returning(|_| Ok(tags(&[("ClusterId", "abc"), ("ClusterName", "lab")])));
        discovery
    }

    // ==========================================================================
    // Story: Reconstruction degrades instead of failing
    // ==========================================================================

    #[test]
    fn when_bucket_is_missing_state_is_still_returned() {
        let mut discovery = discovery_with_tags();
        discovery.expect_cluster_instances().returning(|_| {
            Ok(vec![
                instance("database", "db1"),
                instance("database", "db0"),
                instance("stress", "stress0"),
            ])
        });
        discovery.expect_network_resources().returning(|_| {
            Ok(Infrastructure {
                subnet_ids: vec!["subnet-1".into()],
                security_group_id: Some("sg-1".into()),
                internet_gateway_id: Some("igw-1".into()),
            })
        });
        discovery
            .expect_cluster_bucket()
            .returning(|_| Err(Error::Discovery("NoSuchBucket".into())));

        let state = reconstruct_from_tag(&discovery, "vpc-1").unwrap();

        assert!(state.bucket.is_none());
        assert_eq!(state.name, "lab");
        assert_eq!(state.cluster_id, "abc");
        assert_eq!(state.network_id.as_deref(), Some("vpc-1"));
        assert_eq!(state.infrastructure.subnet_ids, vec!["subnet-1"]);
        let dbs: Vec<_> = state.hosts_for(Role::Database).iter().map(|h| h.alias.as_str()).collect();
        assert_eq!(dbs, vec!["db0", "db1"]);
        assert_eq!(state.hosts_for(Role::Stress).len(), 1);
    }

    #[test]
    fn when_every_sub_query_fails_only_identity_is_populated() {
        let mut discovery = discovery_with_tags();
        discovery
            .expect_cluster_instances()
            .returning(|_| Err(Error::Discovery("throttled".into())));
        discovery
            .expect_network_resources()
            .returning(|_| Err(Error::Discovery("throttled".into())));
        discovery.expect_cluster_bucket().returning(|_| Ok(None));

        let state = reconstruct_from_tag(&discovery, "vpc-1").unwrap();

        assert_eq!(state.cluster_id, "abc");
        assert!(state.hosts.is_empty());
        assert_eq!(state.infrastructure, Infrastructure::default());
    }

    #[test]
    fn unknown_role_tags_are_skipped() {
        let mut discovery = discovery_with_tags();
        discovery
            .expect_cluster_instances()
            .returning(|_| Ok(vec![instance("bastion", "b0"), instance("control", "control0")]));
        discovery
            .expect_network_resources()
            .returning(|_| Ok(Infrastructure::default()));
        discovery
            .expect_cluster_bucket()
            .returning(|_| Ok(Some("dblab-abc".into())));

        let state = reconstruct_from_tag(&discovery, "vpc-1").unwrap();

        assert_eq!(state.bucket.as_deref(), Some("dblab-abc"));
        assert_eq!(state.hosts.len(), 1);
        assert_eq!(state.hosts_for(Role::Control)[0].alias, "control0");
    }

    // ==========================================================================
    // Story: Missing cluster tag is fatal
    // ==========================================================================

    #[test]
    fn when_cluster_tag_is_missing_reconstruction_fails() {
        let mut discovery = MockClusterDiscovery::new();
        discovery
            .expect_network_tags()
            .returning(|_| Ok(tags(&[("Name", "something-else")])));
        discovery.expect_cluster_instances().never();

        let err = reconstruct_from_tag(&discovery, "vpc-9").unwrap_err();
        assert!(matches!(err, Error::Reconstruction { .. }));
        assert!(err.to_string().contains("ClusterId"));
    }

    #[test]
    fn name_falls_back_to_cluster_id() {
        let mut discovery = MockClusterDiscovery::new();
        discovery
            .expect_network_tags()
            .returning(|_| Ok(tags(&[("ClusterId", "abc")])));
        discovery.expect_cluster_instances().returning(|_| Ok(vec![]));
        discovery
            .expect_network_resources()
            .returning(|_| Ok(Infrastructure::default()));
        discovery.expect_cluster_bucket().returning(|_| Ok(None));

        let state = reconstruct_from_tag(&discovery, "vpc-1").unwrap();
        assert_eq!(state.name, "abc");
    }

    #[test]
    fn alias_ordering_is_numeric() {
        let grouped = group_by_role(vec![
            instance("database", "db10"),
            instance("database", "db2"),
        ]);
        let aliases: Vec<_> = grouped[&Role::Database].iter().map(|h| h.alias.clone()).collect();
        assert_eq!(aliases, vec!["db2", "db10"]);
    }

    // ==========================================================================
    // Story: One host per alias
    // ==========================================================================

    #[test]
    fn when_two_instances_share_an_alias_the_running_one_is_kept() {
        let grouped = group_by_role(vec![
            launched("db2", "i-running", true, 8),
            launched("db2", "i-stopped", false, 12),
            launched("db1", "i-db1", true, 8),
        ]);

        let ids: Vec<_> = grouped[&Role::Database]
            .iter()
            .map(|h| (h.alias.as_str(), h.instance_id.as_str()))
            .collect();
        assert_eq!(ids, vec![("db1", "i-db1"), ("db2", "i-running")]);
    }

    #[test]
    fn when_duplicates_are_equally_running_the_newest_is_kept() {
        let grouped = group_by_role(vec![
            launched("db2", "i-new", true, 12),
            launched("db2", "i-old", true, 8),
        ]);

        assert_eq!(grouped[&Role::Database].len(), 1);
        assert_eq!(grouped[&Role::Database][0].instance_id, "i-new");
    }

    #[test]
    fn when_reconstructing_leaked_duplicates_yield_one_host() {
        let mut discovery = discovery_with_tags();
        discovery.expect_cluster_instances().returning(|_| {
            Ok(vec![
                launched("db0", "i-db0", true, 8),
                launched("db2", "i-leaked", true, 9),
                launched("db2", "i-db2", true, 10),
            ])
        });
        discovery
            .expect_network_resources()
            .returning(|_| Ok(Infrastructure::default()));
        discovery.expect_cluster_bucket().returning(|_| Ok(None));

        let state = reconstruct_from_tag(&discovery, "vpc-1").unwrap();

        let aliases: Vec<_> = state.hosts_for(Role::Database).iter().map(|h| h.alias.as_str()).collect();
        assert_eq!(aliases, vec!["db0", "db2"]);
        assert_eq!(state.find_host("db2").unwrap().instance_id, "i-db2");
    }
}
