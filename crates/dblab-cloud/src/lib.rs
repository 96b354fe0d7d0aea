//! dblab cloud layer
//!
//! AWS clients (all driving the `aws` CLI through [`aws::AwsRunner`]) and the
//! concurrent [`provisioner`] built on them.
//!
//! - [`compute`]: EC2 instances
//! - [`addons`]: EMR clusters and OpenSearch domains
//! - [`discovery`]: tag-based discovery used to reconstruct cluster state
//! - [`s3`]: backup object storage

pub mod addons;
pub mod aws;
pub mod compute;
pub mod discovery;
pub mod error;
pub mod provisioner;
pub mod s3;

pub use addons::{AddOnApi, AwsAddOns};
pub use aws::{AwsCli, AwsRunner};
pub use compute::{ComputeApi, Ec2Compute, InstanceRequest};
pub use discovery::AwsDiscovery;
pub use error::ProvisionError;
pub use provisioner::{
    CreatedResource, Placement, ProvisioningRequest, ProvisioningResult, ProvisioningUnit,
    Provisioner, Timeouts,
};
pub use s3::S3Store;

/// Result type for cloud calls
pub type Result<T> = std::result::Result<T, ProvisionError>;
