//! EC2 instances: create, describe, health, terminate.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use dblab_common::reconstruct::{ALIAS_TAG, CLUSTER_ID_TAG, ROLE_TAG};
use dblab_common::{ClusterHost, Role};

use crate::aws::{args, decode, AwsRunner};
use crate::{ProvisionError, Result};

/// Instance states that still count as part of a cluster
const LIVE_STATES: &str = "pending,running,stopping,stopped";

/// A batch of instances for one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRequest {
    /// Cluster identifier tag value
    pub cluster_id: String,
    /// Cluster name, used in the `Name` tag
    pub cluster_name: String,
    /// Role of every instance in the batch
    pub role: Role,
    /// Alias index of the first instance
    pub start_index: usize,
    /// Number of instances
    pub count: usize,
    /// EC2 instance type
    pub instance_type: String,
    /// Machine image
    pub ami: String,
    /// Subnets to spread the instances over, round-robin by alias index
    pub subnet_ids: Vec<String>,
    /// Security group for every instance
    pub security_group_id: Option<String>,
    /// EC2 key pair name
    pub key_name: Option<String>,
}

impl InstanceRequest {
    /// Aliases this request creates, in order
    pub fn aliases(&self) -> Vec<String> {
        (self.start_index..self.start_index + self.count)
            .map(|i| self.role.alias(i))
            .collect()
    }

    /// Subnet for the instance with alias index `index`
    fn subnet_for(&self, index: usize) -> Option<&str> {
        if self.subnet_ids.is_empty() {
            return None;
        }
        Some(&self.subnet_ids[index % self.subnet_ids.len()])
    }
}

/// An instance created by [`ComputeApi::create_instances`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedInstance {
    /// Alias assigned through the `Alias` tag
    pub alias: String,
    /// EC2 instance id
    pub instance_id: String,
}

/// What EC2 reports about an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceInfo {
    /// EC2 instance id
    pub instance_id: String,
    /// `pending`, `running`, ...
    pub state: String,
    /// Public address once assigned
    pub public_ip: Option<String>,
    /// Private address once assigned
    pub private_ip: Option<String>,
    /// Placement availability zone
    pub availability_zone: String,
    /// When EC2 started the instance
    pub launch_time: Option<DateTime<Utc>>,
    /// Instance tags
    pub tags: BTreeMap<String, String>,
}

impl InstanceInfo {
    /// Build a host record once both addresses are known
    pub fn to_host(&self, alias: &str) -> Option<ClusterHost> {
        Some(ClusterHost::new(
            self.public_ip.clone()?,
            self.private_ip.clone()?,
            alias,
            &self.availability_zone,
            &self.instance_id,
        ))
    }
}

/// Compute instance operations.
#[cfg_attr(test, automock)]
pub trait ComputeApi: Send + Sync {
    /// Launch the instances of a request, one alias each.
    ///
    /// Either every instance is launched or none is left running.
    fn create_instances(&self, request: &InstanceRequest) -> Result<Vec<LaunchedInstance>>;

    /// Describe instances by id
    fn describe_instances(&self, ids: &[String]) -> Result<Vec<InstanceInfo>>;

    /// Whether every instance passes both system and instance status checks
    fn status_checks_passed(&self, ids: &[String]) -> Result<bool>;

    /// Terminate instances
    fn terminate_instances(&self, ids: &[String]) -> Result<()>;

    /// Live instances tagged with a cluster id
    fn cluster_instances(&self, cluster_id: &str) -> Result<Vec<InstanceInfo>>;
}

/// Terminate instances that will not join the cluster.
///
/// Failures are only logged; the caller is already reporting an error.
pub(crate) fn discard_instances(compute: &dyn ComputeApi, launched: &[LaunchedInstance]) {
    if launched.is_empty() {
        return;
    }
    let ids: Vec<String> = launched.iter().map(|l| l.instance_id.clone()).collect();
    match compute.terminate_instances(&ids) {
        Ok(()) => warn!(instances = ?ids, "Terminated instances of a failed launch"),
        Err(e) => error!(
            instances = ?ids,
            error = %e,
            "Could not terminate instances of a failed launch; remove them by hand"
        ),
    }
}

/// [`ComputeApi`] over `aws ec2`.
#[derive(Clone)]
pub struct Ec2Compute {
    aws: Arc<dyn AwsRunner>,
}

impl Ec2Compute {
    /// Create a client
    pub fn new(aws: Arc<dyn AwsRunner>) -> Self {
        Self { aws }
    }

    fn launch(&self, request: &InstanceRequest, index: usize) -> Result<LaunchedInstance> {
        let alias = request.role.alias(index);
        let token = Uuid::new_v4().to_string();
        let output: RunInstancesOutput = decode(
            "ec2 run-instances",
            self.aws.json(&run_instances_args(request, index, &token))?,
        )?;
        let instance = output.instances.into_iter().next().ok_or_else(|| {
            ProvisionError::parse("ec2 run-instances", "response listed no instances")
        })?;
        info!(alias = %alias, instance = %instance.instance_id, "Launched instance");
        Ok(LaunchedInstance {
            alias,
            instance_id: instance.instance_id,
        })
    }
}

/// `--tag-specifications` value for one instance
fn tag_specification(request: &InstanceRequest, alias: &str) -> String {
    let name = format!("{}-{}", request.cluster_name, alias);
    let tags = [
        (CLUSTER_ID_TAG, request.cluster_id.as_str()),
        (ROLE_TAG, request.role.tag_value()),
        (ALIAS_TAG, alias),
        ("Name", name.as_str()),
    ]
    .iter()
    .map(|(k, v)| format!("{{Key={},Value={}}}", k, v))
    .collect::<Vec<_>>()
    .join(",");
    format!("ResourceType=instance,Tags=[{}]", tags)
}

/// `aws ec2 run-instances` arguments for one alias.
///
/// `client_token` makes a retried launch return the same instance.
pub fn run_instances_args(
    request: &InstanceRequest,
    index: usize,
    client_token: &str,
) -> Vec<String> {
    let alias = request.role.alias(index);
    let tags = tag_specification(request, &alias);
    let mut cmd = args([
        "ec2",
        "run-instances",
        "--image-id",
        request.ami.as_str(),
        "--instance-type",
        request.instance_type.as_str(),
        "--count",
        "1",
        "--tag-specifications",
        tags.as_str(),
        "--client-token",
        client_token,
    ]);
    if let Some(subnet) = request.subnet_for(index) {
        cmd.extend(args(["--subnet-id", subnet]));
    }
    if let Some(group) = &request.security_group_id {
        cmd.extend(args(["--security-group-ids", group.as_str()]));
    }
    if let Some(key) = &request.key_name {
        cmd.extend(args(["--key-name", key.as_str()]));
    }
    cmd
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunInstancesOutput {
    instances: Vec<Ec2Instance>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstancesOutput {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<Ec2Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ec2Instance {
    instance_id: String,
    #[serde(default)]
    state: Option<InstanceState>,
    #[serde(default)]
    public_ip_address: Option<String>,
    #[serde(default)]
    private_ip_address: Option<String>,
    #[serde(default)]
    placement: Option<Placement>,
    #[serde(default)]
    launch_time: Option<DateTime<Utc>>,
    #[serde(default)]
    tags: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceState {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Placement {
    availability_zone: String,
}

/// EC2 `{Key, Value}` tag
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct Tag {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

/// Collect EC2 tags into a map
pub(crate) fn tag_map(tags: Vec<Tag>) -> BTreeMap<String, String> {
    tags.into_iter().map(|t| (t.key, t.value)).collect()
}

impl From<Ec2Instance> for InstanceInfo {
    fn from(instance: Ec2Instance) -> Self {
        Self {
            instance_id: instance.instance_id,
            state: instance.state.map(|s| s.name).unwrap_or_default(),
            public_ip: instance.public_ip_address,
            private_ip: instance.private_ip_address,
            availability_zone: instance
                .placement
                .map(|p| p.availability_zone)
                .unwrap_or_default(),
            launch_time: instance.launch_time,
            tags: tag_map(instance.tags),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstanceStatusOutput {
    #[serde(default)]
    instance_statuses: Vec<InstanceStatusEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceStatusEntry {
    instance_id: String,
    instance_status: StatusSummary,
    system_status: StatusSummary,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StatusSummary {
    status: String,
}

fn describe(aws: &dyn AwsRunner, cmd: Vec<String>) -> Result<Vec<InstanceInfo>> {
    let value = aws.json(&cmd)?;
    if value.is_null() {
        return Ok(Vec::new());
    }
    let output: DescribeInstancesOutput = decode("ec2 describe-instances", value)?;
    Ok(output
        .reservations
        .into_iter()
        .flat_map(|r| r.instances)
        .map(InstanceInfo::from)
        .collect())
}

impl ComputeApi for Ec2Compute {
    fn create_instances(&self, request: &InstanceRequest) -> Result<Vec<LaunchedInstance>> {
        let mut launched = Vec::with_capacity(request.count);
        for index in request.start_index..request.start_index + request.count {
            match self.launch(request, index) {
                Ok(instance) => launched.push(instance),
                Err(e) => {
                    discard_instances(self, &launched);
                    return Err(e);
                }
            }
        }
        Ok(launched)
    }

    fn describe_instances(&self, ids: &[String]) -> Result<Vec<InstanceInfo>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = args(["ec2", "describe-instances", "--instance-ids"]);
        cmd.extend(ids.iter().cloned());
        describe(self.aws.as_ref(), cmd)
    }

    fn status_checks_passed(&self, ids: &[String]) -> Result<bool> {
        if ids.is_empty() {
            return Ok(true);
        }
        let mut cmd = args([
            "ec2",
            "describe-instance-status",
            "--include-all-instances",
            "--instance-ids",
        ]);
        cmd.extend(ids.iter().cloned());
        let value = self.aws.json(&cmd)?;
        let output: DescribeInstanceStatusOutput = if value.is_null() {
            DescribeInstanceStatusOutput::default()
        } else {
            decode("ec2 describe-instance-status", value)?
        };

        let ok = ids.iter().all(|id| {
            output.instance_statuses.iter().any(|s| {
                &s.instance_id == id
                    && s.instance_status.status == "ok"
                    && s.system_status.status == "ok"
            })
        });
        debug!(instances = ids.len(), ok, "Checked instance status");
        Ok(ok)
    }

    fn terminate_instances(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut cmd = args(["ec2", "terminate-instances", "--instance-ids"]);
        cmd.extend(ids.iter().cloned());
        self.aws.json(&cmd)?;
        info!(instances = ids.len(), "Terminating instances");
        Ok(())
    }

    fn cluster_instances(&self, cluster_id: &str) -> Result<Vec<InstanceInfo>> {
        describe(
            self.aws.as_ref(),
            args([
                "ec2".to_string(),
                "describe-instances".to_string(),
                "--filters".to_string(),
                format!("Name=tag:{},Values={}", CLUSTER_ID_TAG, cluster_id),
                format!("Name=instance-state-name,Values={}", LIVE_STATES),
            ]),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::MockAwsRunner;
    use parking_lot::Mutex;
    use serde_json::json;

    fn request() -> InstanceRequest {
        InstanceRequest {
            cluster_id: "abc123".to_string(),
            cluster_name: "lab".to_string(),
            role: Role::Database,
            start_index: 2,
            count: 2,
            instance_type: "r5d.xlarge".to_string(),
            ami: "ami-0123".to_string(),
            subnet_ids: vec!["subnet-a".to_string(), "subnet-b".to_string()],
            security_group_id: Some("sg-1".to_string()),
            key_name: None,
        }
    }

    fn value_after<'a>(cmd: &'a [String], flag: &str) -> &'a str {
        &cmd[cmd.iter().position(|a| a == flag).unwrap() + 1]
    }

    #[test]
    fn aliases_continue_from_start_index() {
        assert_eq!(request().aliases(), vec!["db2", "db3"]);
    }

    #[test]
    fn run_instances_tags_cluster_role_and_alias() {
        let cmd = run_instances_args(&request(), 3, "token-1");
        assert_eq!(
            value_after(&cmd, "--tag-specifications"),
            "ResourceType=instance,Tags=[{Key=ClusterId,Value=abc123},{Key=Role,Value=database},{Key=Alias,Value=db3},{Key=Name,Value=lab-db3}]"
        );
        assert_eq!(value_after(&cmd, "--subnet-id"), "subnet-b");
        assert_eq!(value_after(&cmd, "--client-token"), "token-1");
        assert!(!cmd.contains(&"--key-name".to_string()));
    }

    #[test]
    fn create_instances_launches_one_per_alias() {
        let tokens = Arc::new(Mutex::new(Vec::new()));
        let seen = tokens.clone();
        let mut aws = MockAwsRunner::new();
        aws.expect_json()
            .withf(|a| a[1] == "run-instances")
            .times(2)
            .returning(move |a| {
                seen.lock().push(value_after(a, "--client-token").to_string());
                let alias = if a.iter().any(|s| s.contains("Value=db2}")) { "2" } else { "3" };
                Ok(json!({"Instances": [{"InstanceId": format!("i-{}", alias)}]}))
            });
        let compute = Ec2Compute::new(Arc::new(aws));

        let launched = compute.create_instances(&request()).unwrap();

        assert_eq!(
            launched,
            vec![
                LaunchedInstance { alias: "db2".into(), instance_id: "i-2".into() },
                LaunchedInstance { alias: "db3".into(), instance_id: "i-3".into() },
            ]
        );
        let tokens = tokens.lock();
        assert_ne!(tokens[0], tokens[1]);
    }

    // ==========================================================================
    // Story: A launch that fails halfway leaves nothing running
    // ==========================================================================

    #[test]
    fn when_a_later_launch_fails_earlier_instances_are_terminated() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = calls.clone();
        let mut aws = MockAwsRunner::new();
        aws.expect_json().returning(move |a| {
            seen.lock().push(a[1].clone());
            match a[1].as_str() {
                "run-instances" if a.iter().any(|s| s.contains("Value=db2}")) => {
                    Ok(json!({"Instances": [{"InstanceId": "i-db2"}]}))
                }
                "run-instances" => Err(ProvisionError::aws(
                    "ec2 run-instances",
                    "InsufficientInstanceCapacity",
                )),
                "terminate-instances" => {
                    assert_eq!(a[3..].to_vec(), vec!["i-db2".to_string()]);
                    Ok(json!({"TerminatingInstances": []}))
                }
                other => panic!("unexpected call {}", other),
            }
        });
        let compute = Ec2Compute::new(Arc::new(aws));

        let err = compute.create_instances(&request()).unwrap_err();

        assert!(err.to_string().contains("InsufficientInstanceCapacity"));
        assert_eq!(
            *calls.lock(),
            vec!["run-instances", "run-instances", "terminate-instances"]
        );
    }

    #[test]
    fn when_the_first_launch_fails_nothing_is_terminated() {
        let mut aws = MockAwsRunner::new();
        aws.expect_json()
            .withf(|a| a[1] == "run-instances")
            .times(1)
            .returning(|_| Err(ProvisionError::aws("ec2 run-instances", "Unsupported")));
        let compute = Ec2Compute::new(Arc::new(aws));

        assert!(compute.create_instances(&request()).is_err());
    }

    #[test]
    fn describe_reads_addresses_zone_and_tags() {
        let mut aws = MockAwsRunner::new();
        aws.expect_json().returning(|_| {
            Ok(json!({
                "Reservations": [{
                    "Instances": [{
                        "InstanceId": "i-1",
                        "State": {"Name": "running"},
                        "PublicIpAddress": "54.1.1.1",
                        "PrivateIpAddress": "10.0.1.11",
                        "Placement": {"AvailabilityZone": "us-west-2a"},
                        "LaunchTime": "2026-03-01T12:00:00+00:00",
                        "Tags": [{"Key": "Alias", "Value": "db0"}]
                    }, {
                        "InstanceId": "i-2",
                        "State": {"Name": "pending"}
                    }]
                }]
            }))
        });
        let compute = Ec2Compute::new(Arc::new(aws));

        let infos = compute
            .describe_instances(&["i-1".to_string(), "i-2".to_string()])
            .unwrap();

        assert_eq!(infos.len(), 2);
        let host = infos[0].to_host("db0").unwrap();
        assert_eq!(host.public_ip, "54.1.1.1");
        assert_eq!(host.availability_zone, "us-west-2a");
        assert_eq!(infos[0].tags.get("Alias").map(String::as_str), Some("db0"));
        assert_eq!(
            infos[0].launch_time.map(|t| t.to_rfc3339()),
            Some("2026-03-01T12:00:00+00:00".to_string())
        );
        assert!(infos[1].launch_time.is_none());
        assert!(infos[1].to_host("db1").is_none());
    }

    #[test]
    fn status_requires_both_checks_for_every_instance() {
        let mut aws = MockAwsRunner::new();
        aws.expect_json().returning(|_| {
            Ok(json!({
                "InstanceStatuses": [
                    {"InstanceId": "i-1", "InstanceStatus": {"Status": "ok"}, "SystemStatus": {"Status": "ok"}},
                    {"InstanceId": "i-2", "InstanceStatus": {"Status": "initializing"}, "SystemStatus": {"Status": "ok"}}
                ]
            }))
        });
        let compute = Ec2Compute::new(Arc::new(aws));

        assert!(compute.status_checks_passed(&["i-1".to_string()]).unwrap());
        assert!(!compute
            .status_checks_passed(&["i-1".to_string(), "i-2".to_string()])
            .unwrap());
        assert!(!compute.status_checks_passed(&["i-3".to_string()]).unwrap());
    }
}
