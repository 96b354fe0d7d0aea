//! Managed add-ons: EMR (Spark) clusters and OpenSearch domains.

use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use tracing::{debug, info};

use dblab_common::poll::poll_until;
use dblab_common::types::{OpenSearchRequest, OpenSearchState, SparkClusterState, SparkRequest};

use crate::aws::{args, decode, AwsRunner};
use crate::{ProvisionError, Result};

/// Maximum length of an OpenSearch domain name
const MAX_DOMAIN_NAME: usize = 28;

/// Where an add-on is placed and how it is tagged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddOnPlacement {
    /// Cluster identifier tag value
    pub cluster_id: String,
    /// Cluster name, used in resource names
    pub cluster_name: String,
    /// Subnets of the cluster network
    pub subnet_ids: Vec<String>,
    /// Security group of the cluster
    pub security_group_id: Option<String>,
    /// EC2 key pair for EMR nodes
    pub key_name: Option<String>,
}

/// Managed add-on operations.
#[cfg_attr(test, automock)]
pub trait AddOnApi: Send + Sync {
    /// Start creating an EMR cluster, returning its id
    fn create_spark_cluster(&self, placement: &AddOnPlacement, request: &SparkRequest) -> Result<String>;

    /// Current state of an EMR cluster
    fn describe_spark_cluster(&self, cluster_id: &str) -> Result<SparkClusterState>;

    /// Start creating an OpenSearch domain, returning its name
    fn create_search_domain(&self, placement: &AddOnPlacement, request: &OpenSearchRequest) -> Result<String>;

    /// Current state of an OpenSearch domain
    fn describe_search_domain(&self, domain_name: &str) -> Result<OpenSearchState>;
}

/// [`AddOnApi`] over `aws emr` and `aws opensearch`.
#[derive(Clone)]
pub struct AwsAddOns {
    aws: Arc<dyn AwsRunner>,
}

impl AwsAddOns {
    /// Create a client
    pub fn new(aws: Arc<dyn AwsRunner>) -> Self {
        Self { aws }
    }
}

/// Domain name derived from the cluster name: lowercase, `[a-z0-9-]`, starts
/// with a letter, at most 28 characters.
pub fn search_domain_name(cluster_name: &str) -> String {
    let mut name: String = cluster_name
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
        name.insert_str(0, "os-");
    }
    name.truncate(MAX_DOMAIN_NAME);
    name.trim_end_matches('-').to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateClusterOutput {
    cluster_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeClusterOutput {
    cluster: EmrCluster,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EmrCluster {
    id: String,
    status: EmrStatus,
    #[serde(default)]
    master_public_dns_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EmrStatus {
    state: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeDomainOutput {
    domain_status: DomainStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DomainStatus {
    domain_name: String,
    #[serde(default)]
    processing: bool,
    #[serde(default)]
    created: bool,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    endpoints: Option<std::collections::BTreeMap<String, String>>,
}

impl AddOnApi for AwsAddOns {
    fn create_spark_cluster(&self, placement: &AddOnPlacement, request: &SparkRequest) -> Result<String> {
        let mut attributes = Vec::new();
        if let Some(subnet) = placement.subnet_ids.first() {
            attributes.push(format!("SubnetId={}", subnet));
        }
        if let Some(key) = &placement.key_name {
            attributes.push(format!("KeyName={}", key));
        }
        if let Some(group) = &placement.security_group_id {
            attributes.push(format!("AdditionalMasterSecurityGroups={}", group));
            attributes.push(format!("AdditionalSlaveSecurityGroups={}", group));
        }

        let mut cmd = args([
            "emr".to_string(),
            "create-cluster".to_string(),
            "--name".to_string(),
            format!("{}-spark", placement.cluster_name),
            "--release-label".to_string(),
            request.release_label.clone(),
            "--applications".to_string(),
            "Name=Spark".to_string(),
            "--use-default-roles".to_string(),
            "--instance-groups".to_string(),
            format!(
                "InstanceGroupType=MASTER,InstanceCount=1,InstanceType={}",
                request.instance_type
            ),
            format!(
                "InstanceGroupType=CORE,InstanceCount={},InstanceType={}",
                request.worker_count, request.instance_type
            ),
            "--tags".to_string(),
            format!("ClusterId={}", placement.cluster_id),
        ]);
        if !attributes.is_empty() {
            cmd.push("--ec2-attributes".to_string());
            cmd.push(attributes.join(","));
        }

        let output: CreateClusterOutput = decode("emr create-cluster", self.aws.json(&cmd)?)?;
        info!(emr_cluster = %output.cluster_id, "EMR cluster requested");
        Ok(output.cluster_id)
    }

    fn describe_spark_cluster(&self, cluster_id: &str) -> Result<SparkClusterState> {
        let output: DescribeClusterOutput = decode(
            "emr describe-cluster",
            self.aws
                .json(&args(["emr", "describe-cluster", "--cluster-id", cluster_id]))?,
        )?;
        Ok(SparkClusterState {
            cluster_id: output.cluster.id,
            master_dns: output.cluster.master_public_dns_name,
            state: output.cluster.status.state,
        })
    }

    fn create_search_domain(&self, placement: &AddOnPlacement, request: &OpenSearchRequest) -> Result<String> {
        let domain = search_domain_name(&placement.cluster_name);
        let mut cmd = args([
            "opensearch".to_string(),
            "create-domain".to_string(),
            "--domain-name".to_string(),
            domain.clone(),
            "--engine-version".to_string(),
            request.engine_version.clone(),
            "--cluster-config".to_string(),
            format!(
                "InstanceType={},InstanceCount={}",
                request.instance_type, request.instance_count
            ),
            "--ebs-options".to_string(),
            format!(
                "EBSEnabled=true,VolumeType=gp3,VolumeSize={}",
                request.volume_size_gb
            ),
            "--tag-list".to_string(),
            format!("Key=ClusterId,Value={}", placement.cluster_id),
        ]);
        if let Some(subnet) = placement.subnet_ids.first() {
            let mut vpc = format!("SubnetIds={}", subnet);
            if let Some(group) = &placement.security_group_id {
                vpc.push_str(&format!(",SecurityGroupIds={}", group));
            }
            cmd.push("--vpc-options".to_string());
            cmd.push(vpc);
        }

        self.aws.json(&cmd)?;
        info!(domain = %domain, "OpenSearch domain requested");
        Ok(domain)
    }

    fn describe_search_domain(&self, domain_name: &str) -> Result<OpenSearchState> {
        let output: DescribeDomainOutput = decode(
            "opensearch describe-domain",
            self.aws
                .json(&args(["opensearch", "describe-domain", "--domain-name", domain_name]))?,
        )?;
        let status = output.domain_status;
        let endpoint = status
            .endpoint
            .or_else(|| status.endpoints.and_then(|e| e.get("vpc").cloned()));
        Ok(OpenSearchState {
            domain_name: status.domain_name,
            active: status.created && !status.processing && endpoint.is_some(),
            endpoint,
        })
    }
}

/// Poll an EMR cluster until it is ready for steps (`WAITING` or `RUNNING`).
pub fn wait_for_spark_cluster(
    api: &dyn AddOnApi,
    cluster_id: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<SparkClusterState> {
    poll_until(timeout, interval, &format!("EMR cluster {}", cluster_id), || {
        let state = api.describe_spark_cluster(cluster_id).map_err(|e| e.to_string())?;
        debug!(emr_cluster = %cluster_id, state = %state.state, "EMR cluster state");
        match state.state.as_str() {
            "WAITING" | "RUNNING" => Ok(Some(state)),
            "TERMINATING" | "TERMINATED" | "TERMINATED_WITH_ERRORS" => {
                Err(format!("cluster entered {}", state.state))
            }
            _ => Ok(None),
        }
    })
    .map_err(|e| ProvisionError::resource("EMR cluster", e.to_string()))
}

/// Poll an OpenSearch domain until it is active with an endpoint.
pub fn wait_for_search_domain(
    api: &dyn AddOnApi,
    domain_name: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<OpenSearchState> {
    poll_until(timeout, interval, &format!("OpenSearch domain {}", domain_name), || {
        let state = api.describe_search_domain(domain_name).map_err(|e| e.to_string())?;
        Ok(state.active.then_some(state))
    })
    .map_err(|e| ProvisionError::resource("OpenSearch domain", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::MockAwsRunner;
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn domain_names_are_sanitized() {
        assert_eq!(search_domain_name("Perf_Lab"), "perf-lab");
        assert_eq!(search_domain_name("42lab"), "os-42lab");
        assert_eq!(
            search_domain_name("a-very-long-cluster-name-for-testing"),
            "a-very-long-cluster-name-for"
        );
        assert!(search_domain_name("x-------------------------------y").len() <= MAX_DOMAIN_NAME);
    }

    #[test]
    fn spark_wait_returns_when_cluster_is_waiting() {
        let states = Mutex::new(vec!["STARTING", "BOOTSTRAPPING", "WAITING"].into_iter());
        let mut api = MockAddOnApi::new();
        api.expect_describe_spark_cluster().returning(move |id| {
            let state = states.lock().next().unwrap_or("WAITING");
            Ok(SparkClusterState {
                cluster_id: id.to_string(),
                master_dns: Some("ec2-1.compute.amazonaws.com".to_string()),
                state: state.to_string(),
            })
        });

        let state =
            wait_for_spark_cluster(&api, "j-1", Duration::from_secs(5), Duration::from_millis(1)).unwrap();
        assert_eq!(state.state, "WAITING");
    }

    #[test]
    fn spark_wait_fails_fast_on_termination() {
        let mut api = MockAddOnApi::new();
        api.expect_describe_spark_cluster().times(1).returning(|id| {
            Ok(SparkClusterState {
                cluster_id: id.to_string(),
                master_dns: None,
                state: "TERMINATED_WITH_ERRORS".to_string(),
            })
        });

        let err = wait_for_spark_cluster(&api, "j-1", Duration::from_secs(5), Duration::from_millis(1))
            .unwrap_err();
        assert!(err.to_string().contains("TERMINATED_WITH_ERRORS"));
    }

    #[test]
    fn describe_domain_prefers_vpc_endpoint_when_no_public_one() {
        let mut aws = MockAwsRunner::new();
        aws.expect_json().returning(|_| {
            Ok(json!({
                "DomainStatus": {
                    "DomainName": "lab",
                    "Created": true,
                    "Processing": false,
                    "Endpoints": {"vpc": "vpc-lab-xyz.us-west-2.es.amazonaws.com"}
                }
            }))
        });
        let api = AwsAddOns::new(Arc::new(aws));

        let state = api.describe_search_domain("lab").unwrap();
        assert!(state.active);
        assert_eq!(
            state.endpoint.as_deref(),
            Some("vpc-lab-xyz.us-west-2.es.amazonaws.com")
        );
    }

    #[test]
    fn create_spark_cluster_passes_release_and_tags() {
        let mut aws = MockAwsRunner::new();
        aws.expect_json()
            .withf(|a| {
                a.contains(&"emr-7.2.0".to_string())
                    && a.contains(&"ClusterId=abc".to_string())
                    && a.contains(&"SubnetId=subnet-a,KeyName=lab-key".to_string())
            })
            .returning(|_| Ok(json!({"ClusterId": "j-ABC"})));
        let api = AwsAddOns::new(Arc::new(aws));

        let placement = AddOnPlacement {
            cluster_id: "abc".to_string(),
            cluster_name: "lab".to_string(),
            subnet_ids: vec!["subnet-a".to_string()],
            security_group_id: None,
            key_name: Some("lab-key".to_string()),
        };
        let request = SparkRequest {
            worker_count: 3,
            instance_type: "m5.xlarge".to_string(),
            release_label: "emr-7.2.0".to_string(),
        };

        assert_eq!(api.create_spark_cluster(&placement, &request).unwrap(), "j-ABC");
    }
}
