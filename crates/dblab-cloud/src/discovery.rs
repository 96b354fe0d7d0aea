//! Cluster discovery from AWS resource tags.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use dblab_common::reconstruct::{ClusterDiscovery, TaggedInstance, ALIAS_TAG, CLUSTER_ID_TAG, ROLE_TAG};
use dblab_common::types::Infrastructure;
use dblab_common::Error;

use crate::aws::{args, decode, AwsRunner};
use crate::compute::{tag_map, ComputeApi, Tag};
use crate::ProvisionError;

/// [`ClusterDiscovery`] over `aws ec2` and `aws s3api`.
pub struct AwsDiscovery {
    aws: Arc<dyn AwsRunner>,
    compute: Arc<dyn ComputeApi>,
}

impl AwsDiscovery {
    /// Create a discovery client
    pub fn new(aws: Arc<dyn AwsRunner>, compute: Arc<dyn ComputeApi>) -> Self {
        Self { aws, compute }
    }

    fn query<T: serde::de::DeserializeOwned>(&self, operation: &str, cmd: Vec<String>) -> Result<T, ProvisionError> {
        decode(operation, self.aws.json(&cmd)?)
    }
}

fn discovery_err(e: ProvisionError) -> Error {
    Error::Discovery(e.to_string())
}

fn vpc_filter(network_id: &str) -> Vec<String> {
    args(["--filters".to_string(), format!("Name=vpc-id,Values={}", network_id)])
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeVpcsOutput {
    #[serde(default)]
    vpcs: Vec<Vpc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Vpc {
    #[serde(default)]
    tags: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeSubnetsOutput {
    #[serde(default)]
    subnets: Vec<Subnet>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Subnet {
    subnet_id: String,
    #[serde(default)]
    availability_zone: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeSecurityGroupsOutput {
    #[serde(default)]
    security_groups: Vec<SecurityGroup>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SecurityGroup {
    group_id: String,
    group_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInternetGatewaysOutput {
    #[serde(default)]
    internet_gateways: Vec<InternetGateway>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InternetGateway {
    internet_gateway_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketsOutput {
    #[serde(default)]
    buckets: Vec<Bucket>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Bucket {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BucketTagging {
    #[serde(default)]
    tag_set: Vec<Tag>,
}

impl ClusterDiscovery for AwsDiscovery {
    fn network_tags(&self, network_id: &str) -> dblab_common::Result<BTreeMap<String, String>> {
        let output: DescribeVpcsOutput = self
            .query(
                "ec2 describe-vpcs",
                args(["ec2", "describe-vpcs", "--vpc-ids", network_id]),
            )
            .map_err(discovery_err)?;
        let vpc = output
            .vpcs
            .into_iter()
            .next()
            .ok_or_else(|| Error::Discovery(format!("network {} not found", network_id)))?;
        Ok(tag_map(vpc.tags))
    }

    fn cluster_instances(&self, cluster_id: &str) -> dblab_common::Result<Vec<TaggedInstance>> {
        let instances = self.compute.cluster_instances(cluster_id).map_err(discovery_err)?;
        Ok(instances
            .into_iter()
            .filter(|i| i.state != "terminated" && i.state != "shutting-down")
            .filter_map(|info| {
                let role_tag = info.tags.get(ROLE_TAG)?.clone();
                let alias = info.tags.get(ALIAS_TAG)?.clone();
                // Stopped instances have no public address; keep them visible.
                let host = dblab_common::ClusterHost::new(
                    info.public_ip.clone().unwrap_or_default(),
                    info.private_ip.clone().unwrap_or_default(),
                    alias,
                    &info.availability_zone,
                    &info.instance_id,
                );
                Some(TaggedInstance {
                    role_tag,
                    host,
                    running: info.state == "running",
                    launch_time: info.launch_time,
                })
            })
            .collect())
    }

    fn network_resources(&self, network_id: &str) -> dblab_common::Result<Infrastructure> {
        let mut cmd = args(["ec2", "describe-subnets"]);
        cmd.extend(vpc_filter(network_id));
        let mut subnets = self
            .query::<DescribeSubnetsOutput>("ec2 describe-subnets", cmd)
            .map_err(discovery_err)?
            .subnets;
        subnets.sort_by(|a, b| a.availability_zone.cmp(&b.availability_zone));

        let mut cmd = args(["ec2", "describe-security-groups"]);
        cmd.extend(vpc_filter(network_id));
        let security_group_id = self
            .query::<DescribeSecurityGroupsOutput>("ec2 describe-security-groups", cmd)
            .map_err(discovery_err)?
            .security_groups
            .into_iter()
            .find(|g| g.group_name != "default")
            .map(|g| g.group_id);

        let cmd = args([
            "ec2".to_string(),
            "describe-internet-gateways".to_string(),
            "--filters".to_string(),
            format!("Name=attachment.vpc-id,Values={}", network_id),
        ]);
        let internet_gateway_id = self
            .query::<DescribeInternetGatewaysOutput>("ec2 describe-internet-gateways", cmd)
            .map_err(discovery_err)?
            .internet_gateways
            .into_iter()
            .next()
            .map(|g| g.internet_gateway_id);

        Ok(Infrastructure {
            subnet_ids: subnets.into_iter().map(|s| s.subnet_id).collect(),
            security_group_id,
            internet_gateway_id,
        })
    }

    fn cluster_bucket(&self, cluster_id: &str) -> dblab_common::Result<Option<String>> {
        let buckets = self
            .query::<ListBucketsOutput>("s3api list-buckets", args(["s3api", "list-buckets"]))
            .map_err(discovery_err)?
            .buckets;

        for bucket in buckets {
            let tagging = self.query::<BucketTagging>(
                "s3api get-bucket-tagging",
                args(["s3api", "get-bucket-tagging", "--bucket", bucket.name.as_str()]),
            );
            match tagging {
                Ok(tagging) => {
                    if tag_map(tagging.tag_set).get(CLUSTER_ID_TAG).map(String::as_str) == Some(cluster_id) {
                        return Ok(Some(bucket.name));
                    }
                }
                // Untagged buckets answer NoSuchTagSet
                Err(e) => debug!(bucket = %bucket.name, error = %e, "Skipping bucket"),
            }
        }
        Ok(None)
    }
}
