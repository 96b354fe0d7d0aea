//! Concurrent resource provisioning.
//!
//! # Model
//!
//! [`Provisioner::provision`] spawns one OS thread per resource type that needs
//! work: one per role with a positive [`ProvisioningUnit::needed`] count and
//! one per requested managed add-on. Workers run concurrently with no ordering
//! between them.
//!
//! A role worker runs strictly in sequence:
//!
//! 1. launch the missing instances, aliases continuing after the existing ones
//! 2. wait until EC2 reports them `running`
//! 3. wait until both status checks pass
//! 4. re-describe them to read final addresses
//!
//! When a worker finishes it takes the accumulator lock, merges its result and
//! calls the `on_created` callback before releasing the lock, so the callback
//! never observes a half-merged increment. A failing worker records its error
//! under a human-readable description and leaves its siblings alone. The call
//! joins every worker before returning.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use dblab_common::poll::poll_until;
use dblab_common::types::{
    AddOnStates, InitConfig, OpenSearchRequest, OpenSearchState, SparkClusterState, SparkRequest,
};
use dblab_common::{ClusterHost, HostMap, Role};

use crate::addons::{wait_for_search_domain, wait_for_spark_cluster, AddOnApi, AddOnPlacement};
use crate::compute::{
    discard_instances, ComputeApi, InstanceInfo, InstanceRequest, LaunchedInstance,
};
use crate::{ProvisionError, Result};

/// Where instances go: image, network, credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placement {
    /// Machine image
    pub ami: String,
    /// Subnets, instances are spread round-robin
    pub subnet_ids: Vec<String>,
    /// Security group
    pub security_group_id: Option<String>,
    /// EC2 key pair name
    pub key_name: Option<String>,
}

/// Sizing of one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningUnit {
    /// Role being sized
    pub role: Role,
    /// Desired host count
    pub desired: usize,
    /// Hosts that already exist
    pub existing: usize,
    /// Instance type for new hosts
    pub instance_type: String,
    /// Placement of new hosts
    pub placement: Placement,
}

impl ProvisioningUnit {
    /// Hosts still to create
    pub fn needed(&self) -> usize {
        self.desired.saturating_sub(self.existing)
    }

    /// Key used in the error map, e.g. `3 db instances`
    pub fn description(&self) -> String {
        format!("{} {} instances", self.needed(), self.role.alias_prefix())
    }
}

/// Everything one `provision` call should bring into existence.
#[derive(Debug, Clone, Default)]
pub struct ProvisioningRequest {
    /// Cluster identifier tag value
    pub cluster_id: String,
    /// Cluster name
    pub cluster_name: String,
    /// One unit per role
    pub units: Vec<ProvisioningUnit>,
    /// Managed Spark cluster to create
    pub spark: Option<SparkRequest>,
    /// Managed search domain to create
    pub opensearch: Option<OpenSearchRequest>,
}

impl ProvisioningRequest {
    /// Plan units for every role from the original init request and the hosts
    /// already in state. Add-ons are requested only if not already present.
    pub fn plan(
        cluster_id: &str,
        cluster_name: &str,
        init: &InitConfig,
        existing: &HostMap,
        existing_add_ons: &AddOnStates,
        placement: &Placement,
    ) -> Self {
        let units = Role::ALL
            .iter()
            .map(|role| ProvisioningUnit {
                role: *role,
                desired: init.desired(*role),
                existing: existing.get(role).map_or(0, Vec::len),
                instance_type: init.instance_type(*role).to_string(),
                placement: placement.clone(),
            })
            .collect();
        Self {
            cluster_id: cluster_id.to_string(),
            cluster_name: cluster_name.to_string(),
            units,
            spark: init.spark.clone().filter(|_| existing_add_ons.spark.is_none()),
            opensearch: init
                .opensearch
                .clone()
                .filter(|_| existing_add_ons.opensearch.is_none()),
        }
    }

    fn add_on_placement(&self) -> AddOnPlacement {
        let placement = self
            .units
            .first()
            .map(|u| u.placement.clone())
            .unwrap_or_default();
        AddOnPlacement {
            cluster_id: self.cluster_id.clone(),
            cluster_name: self.cluster_name.clone(),
            subnet_ids: placement.subnet_ids,
            security_group_id: placement.security_group_id,
            key_name: placement.key_name,
        }
    }
}

/// One increment reported to the `on_created` callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreatedResource {
    /// New hosts of one role
    Hosts {
        /// Role of the hosts
        role: Role,
        /// Hosts in alias order
        hosts: Vec<ClusterHost>,
    },
    /// A ready EMR cluster
    Spark(SparkClusterState),
    /// An active OpenSearch domain
    OpenSearch(OpenSearchState),
}

/// Outcome of one `provision` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisioningResult {
    /// Newly created hosts only, by role
    pub hosts: HostMap,
    /// Failed resource description -> error message
    pub errors: BTreeMap<String, String>,
    /// Newly created add-ons
    pub add_ons: AddOnStates,
    /// Roles that needed no new hosts
    pub already_satisfied: Vec<Role>,
    /// Number of workers that ran
    pub attempted: usize,
}

impl ProvisioningResult {
    /// Whether every worker succeeded
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// `created 2/3 resource types, 1 failed: 2 control instances: <reason>`
    pub fn summary(&self) -> String {
        if self.attempted == 0 {
            return "nothing to create".to_string();
        }
        let created = self.attempted - self.errors.len();
        let mut summary = format!("created {}/{} resource types", created, self.attempted);
        if !self.errors.is_empty() {
            let reasons = self
                .errors
                .iter()
                .map(|(resource, message)| format!("{}: {}", resource, message))
                .collect::<Vec<_>>()
                .join("; ");
            summary.push_str(&format!(", {} failed: {}", self.errors.len(), reasons));
        }
        summary
    }
}

impl fmt::Display for ProvisioningResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Upper bounds for every wait a worker performs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// Instances reaching `running`
    pub running: Duration,
    /// Instances passing status checks
    pub status_ok: Duration,
    /// EMR cluster becoming ready
    pub spark: Duration,
    /// OpenSearch domain becoming active
    pub opensearch: Duration,
    /// Interval between polls
    pub poll_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            running: Duration::from_secs(300),
            status_ok: Duration::from_secs(600),
            spark: Duration::from_secs(1800),
            opensearch: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Merged results, guarded by the one accumulator lock
#[derive(Default)]
struct Accumulator {
    hosts: HostMap,
    add_ons: AddOnStates,
}

impl Accumulator {
    fn merge(&mut self, resource: &CreatedResource) {
        match resource {
            CreatedResource::Hosts { role, hosts } => self
                .hosts
                .entry(*role)
                .or_default()
                .extend(hosts.iter().cloned()),
            CreatedResource::Spark(state) => self.add_ons.spark = Some(state.clone()),
            CreatedResource::OpenSearch(state) => self.add_ons.opensearch = Some(state.clone()),
        }
    }
}

/// A unit of work for one thread
enum Job {
    Role(InstanceRequest),
    Spark(SparkRequest),
    OpenSearch(OpenSearchRequest),
}

impl Job {
    fn description(&self) -> String {
        match self {
            Job::Role(request) => {
                format!("{} {} instances", request.count, request.role.alias_prefix())
            }
            Job::Spark(_) => "EMR cluster".to_string(),
            Job::OpenSearch(_) => "OpenSearch domain".to_string(),
        }
    }
}

/// Fans resource creation out over threads.
pub struct Provisioner {
    compute: Arc<dyn ComputeApi>,
    add_ons: Arc<dyn AddOnApi>,
    timeouts: Timeouts,
}

impl Provisioner {
    /// Create a provisioner with default timeouts
    pub fn new(compute: Arc<dyn ComputeApi>, add_ons: Arc<dyn AddOnApi>) -> Self {
        Self {
            compute,
            add_ons,
            timeouts: Timeouts::default(),
        }
    }

    /// Override wait bounds
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Create every missing resource of `request`.
    ///
    /// `existing` is never modified; it only decides where new aliases start.
    /// `on_created` runs once per successful worker, under the accumulator lock.
    pub fn provision(
        &self,
        request: &ProvisioningRequest,
        existing: &HostMap,
        on_created: &(dyn Fn(&CreatedResource) + Sync),
    ) -> ProvisioningResult {
        let mut jobs = Vec::new();
        let mut already_satisfied = Vec::new();

        for unit in &request.units {
            if unit.needed() == 0 {
                if unit.existing > 0 {
                    already_satisfied.push(unit.role);
                }
                continue;
            }
            let start_index = next_index(existing.get(&unit.role).map(Vec::as_slice).unwrap_or(&[]))
                .max(unit.existing);
            jobs.push(Job::Role(InstanceRequest {
                cluster_id: request.cluster_id.clone(),
                cluster_name: request.cluster_name.clone(),
                role: unit.role,
                start_index,
                count: unit.needed(),
                instance_type: unit.instance_type.clone(),
                ami: unit.placement.ami.clone(),
                subnet_ids: unit.placement.subnet_ids.clone(),
                security_group_id: unit.placement.security_group_id.clone(),
                key_name: unit.placement.key_name.clone(),
            }));
        }
        if let Some(spark) = &request.spark {
            jobs.push(Job::Spark(spark.clone()));
        }
        if let Some(opensearch) = &request.opensearch {
            jobs.push(Job::OpenSearch(opensearch.clone()));
        }

        let attempted = jobs.len();
        if attempted == 0 {
            info!(cluster = %request.cluster_name, "All resources already exist");
            return ProvisioningResult {
                already_satisfied,
                ..Default::default()
            };
        }
        info!(cluster = %request.cluster_name, workers = attempted, "Provisioning resources");

        let accumulator = Mutex::new(Accumulator::default());
        let errors: DashMap<String, String> = DashMap::new();
        let add_on_placement = request.add_on_placement();

        thread::scope(|scope| {
            let handles: Vec<_> = jobs
                .iter()
                .map(|job| {
                    let accumulator = &accumulator;
                    let errors = &errors;
                    let add_on_placement = &add_on_placement;
                    let handle = scope.spawn(move || {
                        let description = job.description();
                        match self.run_job(job, add_on_placement) {
                            Ok(resource) => {
                                let mut acc = accumulator.lock();
                                acc.merge(&resource);
                                on_created(&resource);
                                info!(resource = %description, "Created");
                            }
                            Err(e) => {
                                error!(resource = %description, error = %e, "Provisioning failed");
                                errors.insert(description, e.to_string());
                            }
                        }
                    });
                    (job.description(), handle)
                })
                .collect();

            for (description, handle) in handles {
                if handle.join().is_err() {
                    errors.insert(description, "worker panicked".to_string());
                }
            }
        });

        let Accumulator { hosts, add_ons } = accumulator.into_inner();
        let result = ProvisioningResult {
            hosts,
            errors: errors.into_iter().collect(),
            add_ons,
            already_satisfied,
            attempted,
        };
        if result.is_success() {
            info!(cluster = %request.cluster_name, "{}", result.summary());
        } else {
            warn!(cluster = %request.cluster_name, "{}", result.summary());
        }
        result
    }

    fn run_job(&self, job: &Job, placement: &AddOnPlacement) -> Result<CreatedResource> {
        match job {
            Job::Role(request) => self.create_hosts(request),
            Job::Spark(spark) => {
                let id = self.add_ons.create_spark_cluster(placement, spark)?;
                let state = wait_for_spark_cluster(
                    self.add_ons.as_ref(),
                    &id,
                    self.timeouts.spark,
                    self.timeouts.poll_interval,
                )?;
                Ok(CreatedResource::Spark(state))
            }
            Job::OpenSearch(opensearch) => {
                let domain = self.add_ons.create_search_domain(placement, opensearch)?;
                let state = wait_for_search_domain(
                    self.add_ons.as_ref(),
                    &domain,
                    self.timeouts.opensearch,
                    self.timeouts.poll_interval,
                )?;
                Ok(CreatedResource::OpenSearch(state))
            }
        }
    }

    /// Launch a role's instances and wait for them. Instances that never
    /// become usable are terminated so a later run can reuse their aliases.
    fn create_hosts(&self, request: &InstanceRequest) -> Result<CreatedResource> {
        let launched = self.compute.create_instances(request)?;
        match self.await_hosts(request.role, &launched) {
            Ok(hosts) => Ok(CreatedResource::Hosts {
                role: request.role,
                hosts,
            }),
            Err(e) => {
                discard_instances(self.compute.as_ref(), &launched);
                Err(e)
            }
        }
    }

    fn await_hosts(&self, role: Role, launched: &[LaunchedInstance]) -> Result<Vec<ClusterHost>> {
        let ids: Vec<String> = launched.iter().map(|l| l.instance_id.clone()).collect();

        poll_until(
            self.timeouts.running,
            self.timeouts.poll_interval,
            &format!("{} instances running", role.alias_prefix()),
            || {
                let infos = self.compute.describe_instances(&ids).map_err(|e| e.to_string())?;
                if let Some(dead) = infos
                    .iter()
                    .find(|i| i.state == "terminated" || i.state == "shutting-down")
                {
                    return Err(format!("instance {} is {}", dead.instance_id, dead.state));
                }
                let running =
                    infos.len() == ids.len() && infos.iter().all(|i| i.state == "running");
                Ok(running.then_some(()))
            },
        )?;

        poll_until(
            self.timeouts.status_ok,
            self.timeouts.poll_interval,
            &format!("{} instance status checks", role.alias_prefix()),
            || {
                let ok = self.compute.status_checks_passed(&ids).map_err(|e| e.to_string())?;
                Ok(ok.then_some(()))
            },
        )?;

        let infos = self.compute.describe_instances(&ids)?;
        launched
            .iter()
            .map(|l| {
                infos
                    .iter()
                    .find(|i| i.instance_id == l.instance_id)
                    .and_then(|i: &InstanceInfo| i.to_host(&l.alias))
                    .ok_or_else(|| {
                        ProvisionError::resource(
                            l.alias.clone(),
                            format!("instance {} has no addresses", l.instance_id),
                        )
                    })
            })
            .collect()
    }
}

/// First alias index not used by `hosts`
fn next_index(hosts: &[ClusterHost]) -> usize {
    hosts
        .iter()
        .filter_map(|h| {
            let digits = h.alias.trim_start_matches(|c: char| !c.is_ascii_digit());
            digits.parse::<usize>().ok()
        })
        .map(|i| i + 1)
        .max()
        .unwrap_or(0)
}
