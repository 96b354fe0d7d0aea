//! Cluster topology types shared by every crate.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Functional group a host belongs to.
///
/// Roles drive both provisioning sizing and remote-operation targeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Distributed database nodes
    Database,
    /// Load-generator nodes
    Stress,
    /// Control nodes (orchestrator, dashboards, monitoring)
    Control,
}

impl Role {
    /// All roles in provisioning order
    pub const ALL: [Role; 3] = [Role::Database, Role::Stress, Role::Control];

    /// Alias prefix for hosts in this role (`db0`, `stress1`, ...)
    pub fn alias_prefix(&self) -> &'static str {
        match self {
            Role::Database => "db",
            Role::Stress => "stress",
            Role::Control => "control",
        }
    }

    /// Value written to the `Role` tag on cloud resources
    pub fn tag_value(&self) -> &'static str {
        match self {
            Role::Database => "database",
            Role::Stress => "stress",
            Role::Control => "control",
        }
    }

    /// Alias for the host at `index` within this role
    pub fn alias(&self, index: usize) -> String {
        format!("{}{}", self.alias_prefix(), index)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag_value())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "database" | "db" | "cassandra" => Ok(Role::Database),
            "stress" | "app" => Ok(Role::Stress),
            "control" => Ok(Role::Control),
            other => Err(Error::validation(format!("unknown role: {}", other))),
        }
    }
}

/// A provisioned host. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterHost {
    /// Address reachable from the operator's machine
    pub public_ip: String,
    /// Address inside the cluster network
    pub private_ip: String,
    /// Role-scoped alias, unique within its role
    pub alias: String,
    /// Availability zone the instance was placed in
    pub availability_zone: String,
    /// Cloud instance identifier
    pub instance_id: String,
}

impl ClusterHost {
    /// Create a host record
    pub fn new(
        public_ip: impl Into<String>,
        private_ip: impl Into<String>,
        alias: impl Into<String>,
        availability_zone: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            public_ip: public_ip.into(),
            private_ip: private_ip.into(),
            alias: alias.into(),
            availability_zone: availability_zone.into(),
            instance_id: instance_id.into(),
        }
    }
}

impl fmt::Display for ClusterHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.alias, self.public_ip)
    }
}

/// Hosts grouped by role, each list in alias-index order.
pub type HostMap = BTreeMap<Role, Vec<ClusterHost>>;

/// Count hosts across every role
pub fn host_count(hosts: &HostMap) -> usize {
    hosts.values().map(Vec::len).sum()
}

/// Network sub-resources discovered or created for a cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Infrastructure {
    /// Subnet identifiers, one per availability zone
    #[serde(default)]
    pub subnet_ids: Vec<String>,
    /// Security group guarding every instance
    pub security_group_id: Option<String>,
    /// Internet gateway attached to the network
    pub internet_gateway_id: Option<String>,
}

/// Parameters of the original `init` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitConfig {
    /// Desired database node count
    pub db_count: usize,
    /// Desired load-generator node count
    pub stress_count: usize,
    /// Desired control node count
    pub control_count: usize,
    /// Instance type for database nodes
    pub db_instance_type: String,
    /// Instance type for load-generator nodes
    pub stress_instance_type: String,
    /// Instance type for control nodes
    pub control_instance_type: String,
    /// Machine image used for every instance
    pub ami: String,
    /// Cloud region
    pub region: String,
    /// Managed Spark cluster request, if any
    pub spark: Option<SparkRequest>,
    /// Managed search domain request, if any
    pub opensearch: Option<OpenSearchRequest>,
}

impl InitConfig {
    /// Desired host count for a role
    pub fn desired(&self, role: Role) -> usize {
        match role {
            Role::Database => self.db_count,
            Role::Stress => self.stress_count,
            Role::Control => self.control_count,
        }
    }

    /// Instance type for a role
    pub fn instance_type(&self, role: Role) -> &str {
        match role {
            Role::Database => &self.db_instance_type,
            Role::Stress => &self.stress_instance_type,
            Role::Control => &self.control_instance_type,
        }
    }
}

/// Managed Spark (EMR) cluster request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SparkRequest {
    /// Core (worker) node count
    pub worker_count: usize,
    /// Instance type for master and workers
    pub instance_type: String,
    /// EMR release label, e.g. `emr-7.2.0`
    pub release_label: String,
}

/// Managed search (OpenSearch) domain request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenSearchRequest {
    /// Data node count
    pub instance_count: usize,
    /// Data node instance type, e.g. `r6g.large.search`
    pub instance_type: String,
    /// Engine version, e.g. `OpenSearch_2.13`
    pub engine_version: String,
    /// EBS volume size per node in GiB
    pub volume_size_gb: u32,
}

/// Managed Spark cluster as reported by the cloud.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SparkClusterState {
    /// Cloud cluster identifier
    pub cluster_id: String,
    /// Master node public DNS name
    pub master_dns: Option<String>,
    /// Last observed cluster state (`WAITING`, `RUNNING`, ...)
    pub state: String,
}

/// Managed search domain as reported by the cloud.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenSearchState {
    /// Domain name
    pub domain_name: String,
    /// HTTPS endpoint once the domain is active
    pub endpoint: Option<String>,
    /// Whether the domain finished processing
    pub active: bool,
}

/// State of optional managed add-ons.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddOnStates {
    /// Managed Spark cluster
    pub spark: Option<SparkClusterState>,
    /// Managed search domain
    pub opensearch: Option<OpenSearchState>,
}
