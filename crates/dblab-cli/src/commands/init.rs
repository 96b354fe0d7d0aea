//! `dblab init`: create `state.json` for a new cluster.

use clap::Args;
use tracing::info;
use uuid::Uuid;

use dblab_common::config::UserConfig;
use dblab_common::types::{InitConfig, OpenSearchRequest, SparkRequest};
use dblab_common::ClusterState;

use crate::context::Context;
use crate::pipeline::CommandSpec;
use crate::queue::QueueHandle;
use crate::{Commands, Error, Result};

/// Create a new cluster definition in the working directory
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct InitArgs {
    /// Cluster name
    pub name: String,

    /// Database node count
    #[arg(long, default_value_t = 3)]
    pub db: usize,

    /// Load-generator node count
    #[arg(long, default_value_t = 0)]
    pub stress: usize,

    /// Control node count
    #[arg(long, default_value_t = 0)]
    pub control: usize,

    /// Database instance type (defaults to the profile's)
    #[arg(long)]
    pub db_instance_type: Option<String>,

    /// Load-generator instance type (defaults to the profile's)
    #[arg(long)]
    pub stress_instance_type: Option<String>,

    /// Control instance type (defaults to the profile's)
    #[arg(long)]
    pub control_instance_type: Option<String>,

    /// Machine image (defaults to the profile's)
    #[arg(long)]
    pub ami: Option<String>,

    /// Request a managed Spark cluster with this many workers
    #[arg(long)]
    pub spark_workers: Option<usize>,

    #[arg(long, default_value = "m5.xlarge")]
    pub spark_instance_type: String,

    #[arg(long, default_value = "emr-7.2.0")]
    pub spark_release: String,

    /// Request a managed search domain with this many data nodes
    #[arg(long)]
    pub opensearch_nodes: Option<usize>,

    #[arg(long, default_value = "r6g.large.search")]
    pub opensearch_instance_type: String,

    #[arg(long, default_value = "OpenSearch_2.13")]
    pub opensearch_version: String,

    /// EBS volume per search node in GiB
    #[arg(long, default_value_t = 100)]
    pub opensearch_volume_gb: u32,

    /// Overwrite an existing state.json
    #[arg(long)]
    pub force: bool,
}

impl InitArgs {
    /// Resolve flags against the profile defaults
    pub fn init_config(&self, profile: &UserConfig) -> Result<InitConfig> {
        let ami = self
            .ami
            .clone()
            .or_else(|| profile.ami.clone())
            .ok_or_else(|| Error::validation("no AMI given and none in profile"))?;
        if self.db + self.stress + self.control == 0 {
            return Err(Error::validation("cluster needs at least one host"));
        }

        Ok(InitConfig {
            db_count: self.db,
            stress_count: self.stress,
            control_count: self.control,
            db_instance_type: pick(&self.db_instance_type, &profile.db_instance_type),
            stress_instance_type: pick(&self.stress_instance_type, &profile.stress_instance_type),
            control_instance_type: pick(&self.control_instance_type, &profile.control_instance_type),
            ami,
            region: profile.region.clone(),
            spark: self.spark_workers.map(|worker_count| SparkRequest {
                worker_count,
                instance_type: self.spark_instance_type.clone(),
                release_label: self.spark_release.clone(),
            }),
            opensearch: self.opensearch_nodes.map(|instance_count| OpenSearchRequest {
                instance_count,
                instance_type: self.opensearch_instance_type.clone(),
                engine_version: self.opensearch_version.clone(),
                volume_size_gb: self.opensearch_volume_gb,
            }),
        })
    }
}

fn pick(flag: &Option<String>, default: &str) -> String {
    flag.clone().unwrap_or_else(|| default.to_string())
}

/// Short random cluster identifier
pub fn generate_cluster_id() -> String {
    Uuid::new_v4().simple().to_string().chars().take(8).collect()
}

pub fn spec() -> CommandSpec<InitArgs> {
    CommandSpec::new("init", execute)
}

fn execute(ctx: &Context, args: &InitArgs, _queue: &QueueHandle<Commands>) -> Result<()> {
    if ctx.store.exists() && !args.force {
        return Err(Error::validation(format!(
            "{} already exists; use --force to overwrite",
            ctx.store.path().display()
        )));
    }

    let init = args.init_config(&ctx.profile)?;
    let mut state = ClusterState::new(&args.name, generate_cluster_id(), init);
    state.bucket = ctx.profile.bucket.clone();
    ctx.save_state(&state)?;

    info!(cluster = %state.name, cluster_id = %state.cluster_id, "Initialized cluster");
    println!("Initialized cluster {} ({})", state.name, state.cluster_id);
    println!("Run 'dblab up' to create it.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_context;
    use crate::pipeline::run_pipeline;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: InitArgs,
    }

    fn parse(argv: &[&str]) -> InitArgs {
        Harness::parse_from(std::iter::once("init").chain(argv.iter().copied())).args
    }

    #[test]
    fn flags_override_profile_defaults() {
        let args = parse(&["lab", "--db", "5", "--db-instance-type", "i4i.large"]);
        let profile = UserConfig {
            ami: Some("ami-profile".to_string()),
            ..Default::default()
        };

        let init = args.init_config(&profile).unwrap();
        assert_eq!(init.db_count, 5);
        assert_eq!(init.db_instance_type, "i4i.large");
        assert_eq!(init.stress_instance_type, profile.stress_instance_type);
        assert_eq!(init.ami, "ami-profile");
        assert!(init.spark.is_none());
    }

    #[test]
    fn add_on_flags_build_requests() {
        let args = parse(&["lab", "--ami", "ami-1", "--spark-workers", "2", "--opensearch-nodes", "3"]);
        let init = args.init_config(&UserConfig::default()).unwrap();

        assert_eq!(init.spark.unwrap().worker_count, 2);
        let search = init.opensearch.unwrap();
        assert_eq!(search.instance_count, 3);
        assert_eq!(search.volume_size_gb, 100);
    }

    #[test]
    fn missing_ami_is_rejected() {
        let args = parse(&["lab"]);
        assert!(matches!(
            args.init_config(&UserConfig::default()),
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn cluster_ids_are_short_hex() {
        let id = generate_cluster_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    // ==========================================================================
    // Story: Initializing a working directory
    // ==========================================================================

    #[test]
    fn when_initializing_state_is_written_with_profile_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());

        run_pipeline(&ctx, &spec(), &parse(&["lab"]), &QueueHandle::new()).unwrap();

        let state = ctx.load_state().unwrap();
        assert_eq!(state.name, "lab");
        assert_eq!(state.bucket.as_deref(), Some("dblab-test"));
        assert_eq!(state.init_config.unwrap().ami, "ami-123");
        assert!(state.hosts.is_empty());
    }

    #[test]
    fn when_state_exists_init_refuses_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        run_pipeline(&ctx, &spec(), &parse(&["lab"]), &QueueHandle::new()).unwrap();
        let first = ctx.load_state().unwrap().cluster_id;

        assert!(run_pipeline(&ctx, &spec(), &parse(&["lab"]), &QueueHandle::new()).is_err());
        run_pipeline(&ctx, &spec(), &parse(&["lab", "--force"]), &QueueHandle::new()).unwrap();
        assert_ne!(ctx.load_state().unwrap().cluster_id, first);
    }
}
