//! Composition root.
//!
//! [`Context`] is built once per process from the command-line flags and the
//! user profile. Everything a command needs is reachable from it; clients that
//! depend on cluster data (the bucket for object storage) are created on
//! demand through the [`ClientFactory`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dblab_cloud::{
    AddOnApi, AwsAddOns, AwsCli, AwsDiscovery, AwsRunner, ComputeApi, Ec2Compute, Provisioner,
    S3Store,
};
use dblab_common::backup::ObjectStore;
use dblab_common::config::{load_profile, resolve_profile_dir, UserConfig};
use dblab_common::reconstruct::ClusterDiscovery;
use dblab_common::{ClusterState, StateStore};
use dblab_remote::{
    OpenSsh, ProxyManager, RemoteOperations, ResourceManager, SshConfig, SshRemoteOperations,
    SshTransport, TunnelManager,
};

use crate::Result;

/// Creates the clients commands talk to.
pub trait ClientFactory: Send + Sync {
    /// EC2 client
    fn compute(&self) -> Arc<dyn ComputeApi>;

    /// Managed add-on client
    fn add_ons(&self) -> Arc<dyn AddOnApi>;

    /// Tag-based discovery
    fn discovery(&self) -> Arc<dyn ClusterDiscovery>;

    /// Object storage for one bucket
    fn object_store(&self, bucket: &str) -> Arc<dyn ObjectStore>;

    /// SSH transport
    fn transport(&self) -> Arc<dyn SshTransport>;

    /// Remote operations over [`ClientFactory::transport`]
    fn remote(&self) -> Arc<dyn RemoteOperations> {
        Arc::new(SshRemoteOperations::new(self.transport()))
    }

    /// Provisioner over [`ClientFactory::compute`] and [`ClientFactory::add_ons`]
    fn provisioner(&self) -> Provisioner {
        Provisioner::new(self.compute(), self.add_ons())
    }
}

/// [`ClientFactory`] for AWS over the `aws` CLI and OpenSSH.
pub struct AwsClientFactory {
    aws: Arc<dyn AwsRunner>,
    ssh: Arc<OpenSsh>,
}

impl AwsClientFactory {
    /// Build clients from the user profile
    pub fn from_profile(profile: &UserConfig) -> Self {
        let ssh = SshConfig {
            user: profile.ssh_user.clone(),
            key_path: profile.ssh_key_path.clone(),
            ..Default::default()
        };
        Self {
            aws: Arc::new(AwsCli::new(&profile.region, profile.aws_profile.clone())),
            ssh: Arc::new(OpenSsh::new(ssh)),
        }
    }
}

impl ClientFactory for AwsClientFactory {
    fn compute(&self) -> Arc<dyn ComputeApi> {
        Arc::new(Ec2Compute::new(self.aws.clone()))
    }

    fn add_ons(&self) -> Arc<dyn AddOnApi> {
        Arc::new(AwsAddOns::new(self.aws.clone()))
    }

    fn discovery(&self) -> Arc<dyn ClusterDiscovery> {
        Arc::new(AwsDiscovery::new(self.aws.clone(), self.compute()))
    }

    fn object_store(&self, bucket: &str) -> Arc<dyn ObjectStore> {
        Arc::new(S3Store::new(self.aws.clone(), bucket))
    }

    fn transport(&self) -> Arc<dyn SshTransport> {
        self.ssh.clone()
    }
}

/// Everything a command runs against.
pub struct Context {
    /// Working directory holding `state.json` and generated files
    pub work_dir: PathBuf,
    /// Profile directory
    pub profile_dir: PathBuf,
    /// User profile
    pub profile: UserConfig,
    /// State persistence for `work_dir`
    pub store: StateStore,
    /// Client construction
    pub factory: Arc<dyn ClientFactory>,
    /// Cleanup registry for tunnels and proxies
    pub resources: Arc<ResourceManager>,
    /// Tunnel manager
    pub tunnels: TunnelManager,
    /// Proxy manager
    pub proxy: ProxyManager,
}

impl Context {
    /// Resolve the profile and build the AWS-backed context
    pub fn from_flags(work_dir: &Path, profile_dir: Option<&Path>) -> Result<Self> {
        let profile_dir = resolve_profile_dir(profile_dir)?;
        let profile = load_profile(&profile_dir)?;
        let factory = Arc::new(AwsClientFactory::from_profile(&profile));
        Ok(Self::new(work_dir, profile_dir, profile, factory))
    }

    /// Assemble a context from parts
    pub fn new(
        work_dir: &Path,
        profile_dir: PathBuf,
        profile: UserConfig,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        let resources = Arc::new(ResourceManager::new());
        let transport = factory.transport();
        Self {
            work_dir: work_dir.to_path_buf(),
            profile_dir,
            profile,
            store: StateStore::new(work_dir),
            tunnels: TunnelManager::new(transport.clone(), resources.clone()),
            proxy: ProxyManager::new(transport, resources.clone()),
            resources,
            factory,
        }
    }

    /// Load `state.json` from the working directory
    pub fn load_state(&self) -> Result<ClusterState> {
        Ok(self.store.load()?)
    }

    /// Save `state.json` to the working directory
    pub fn save_state(&self, state: &ClusterState) -> Result<()> {
        Ok(self.store.save(state)?)
    }

    /// Object storage for the cluster's bucket, if it has one
    pub fn object_store_for(&self, state: &ClusterState) -> Option<Arc<dyn ObjectStore>> {
        state
            .bucket
            .as_deref()
            .or(self.profile.bucket.as_deref())
            .map(|bucket| self.factory.object_store(bucket))
    }
}
