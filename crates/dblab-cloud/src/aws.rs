//! Thin wrapper over the `aws` command-line client.

use std::process::{Command, Stdio};

#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use tracing::debug;

use dblab_common::poll::{retry_with_backoff, RetryConfig};

use crate::{ProvisionError, Result};

/// Runs `aws` subcommands.
#[cfg_attr(test, automock)]
pub trait AwsRunner: Send + Sync {
    /// Run a subcommand that prints JSON and parse its output.
    ///
    /// Empty output parses as [`Value::Null`].
    fn json(&self, args: &[String]) -> Result<Value>;

    /// Run a subcommand and return its raw stdout
    fn text(&self, args: &[String]) -> Result<String>;
}

/// [`AwsRunner`] shelling out to the installed `aws` binary.
#[derive(Debug, Clone)]
pub struct AwsCli {
    region: String,
    profile: Option<String>,
    retry: RetryConfig,
}

impl AwsCli {
    /// Target `region`, optionally with a named credentials profile
    pub fn new(region: impl Into<String>, profile: Option<String>) -> Self {
        Self {
            region: region.into(),
            profile,
            retry: RetryConfig::default(),
        }
    }

    /// Region every call targets
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Full argument list for one invocation
    pub fn full_args(&self, args: &[String], json: bool) -> Vec<String> {
        let mut full = args.to_vec();
        full.push("--region".to_string());
        full.push(self.region.clone());
        if let Some(profile) = &self.profile {
            full.push("--profile".to_string());
            full.push(profile.clone());
        }
        if json {
            full.push("--output".to_string());
            full.push("json".to_string());
        }
        full
    }

    fn run(&self, args: &[String], json: bool) -> Result<String> {
        let operation = operation_name(args);
        let full = self.full_args(args, json);
        let retry = if is_safe_to_retry(args) {
            self.retry.clone()
        } else {
            RetryConfig::with_max_attempts(1)
        };
        retry_with_backoff(&retry, &operation, ProvisionError::is_retryable, || {
            debug!(operation = %operation, "Running aws");
            let output = Command::new("aws")
                .args(&full)
                .stdin(Stdio::null())
                .output()
                .map_err(|e| ProvisionError::aws(&operation, format!("failed to run aws: {}", e)))?;
            if !output.status.success() {
                return Err(ProvisionError::aws(
                    &operation,
                    String::from_utf8_lossy(&output.stderr).trim().to_string(),
                ));
            }
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        })
    }
}

impl AwsRunner for AwsCli {
    fn json(&self, args: &[String]) -> Result<Value> {
        let stdout = self.run(args, true)?;
        if stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&stdout)
            .map_err(|e| ProvisionError::parse(operation_name(args), e.to_string()))
    }

    fn text(&self, args: &[String]) -> Result<String> {
        self.run(args, false)
    }
}

/// `service subcommand`, used in logs and errors
pub fn operation_name(args: &[String]) -> String {
    args.iter().take(2).cloned().collect::<Vec<_>>().join(" ")
}

/// Whether repeating `args` cannot create a second resource.
///
/// `create-*` and `run-*` calls are retried only with a `--client-token`.
pub fn is_safe_to_retry(args: &[String]) -> bool {
    let verb = args.get(1).map(String::as_str).unwrap_or_default();
    let creates = verb.starts_with("create-") || verb.starts_with("run-");
    !creates || args.iter().any(|a| a == "--client-token")
}

/// Build an owned argument list
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

/// Deserialize a CLI response into a typed shape
pub fn decode<T: serde::de::DeserializeOwned>(operation: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| ProvisionError::parse(operation, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_profile_and_output_are_appended() {
        let cli = AwsCli::new("eu-west-1", Some("lab".to_string()));
        let full = cli.full_args(&args(["ec2", "describe-vpcs"]), true);
        assert_eq!(
            full,
            vec![
                "ec2",
                "describe-vpcs",
                "--region",
                "eu-west-1",
                "--profile",
                "lab",
                "--output",
                "json"
            ]
        );

        let cli = AwsCli::new("us-west-2", None);
        let full = cli.full_args(&args(["s3", "cp", "a", "b"]), false);
        assert_eq!(full, vec!["s3", "cp", "a", "b", "--region", "us-west-2"]);
    }

    #[test]
    fn operation_name_is_service_and_verb() {
        assert_eq!(
            operation_name(&args(["ec2", "run-instances", "--count", "1"])),
            "ec2 run-instances"
        );
    }

    #[test]
    fn only_idempotent_calls_are_retried() {
        assert!(is_safe_to_retry(&args(["ec2", "describe-instances"])));
        assert!(is_safe_to_retry(&args(["s3", "cp", "a", "s3://b/a"])));
        assert!(is_safe_to_retry(&args(["ec2", "terminate-instances", "--instance-ids", "i-1"])));
        assert!(is_safe_to_retry(&args([
            "ec2",
            "run-instances",
            "--client-token",
            "t-1"
        ])));
        assert!(!is_safe_to_retry(&args(["ec2", "run-instances", "--count", "1"])));
        assert!(!is_safe_to_retry(&args(["emr", "create-cluster"])));
        assert!(!is_safe_to_retry(&args(["opensearch", "create-domain"])));
    }
}
