//! Cluster state document and its store.
//!
//! `state.json` in the working directory is the single source of truth for a
//! cluster. Callers load it, mutate it in place, and save it explicitly within
//! one logical operation; there is no write-through and no multi-process
//! locking.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{AddOnStates, ClusterHost, HostMap, Infrastructure, InitConfig, Role};
use crate::{Error, Result};

/// File name of the state document inside the working directory
pub const STATE_FILE_NAME: &str = "state.json";

/// Persisted topology and configuration of one cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterState {
    /// Human-chosen cluster name
    pub name: String,
    /// Generated identifier written to the `ClusterId` tag of every resource
    pub cluster_id: String,
    /// Cloud network (VPC) identifier
    pub network_id: Option<String>,
    /// Hosts grouped by role
    #[serde(default)]
    pub hosts: HostMap,
    /// Network sub-resources
    #[serde(default)]
    pub infrastructure: Infrastructure,
    /// Object-storage bucket holding backups
    pub bucket: Option<String>,
    /// Backup target name -> hex digest of the last uploaded content
    #[serde(default)]
    pub backup_hashes: BTreeMap<String, String>,
    /// Host alias -> software name -> version
    #[serde(default)]
    pub versions: BTreeMap<String, BTreeMap<String, String>>,
    /// Original provisioning request
    pub init_config: Option<InitConfig>,
    /// Managed add-ons created for this cluster
    #[serde(default)]
    pub add_ons: AddOnStates,
    /// When `init` created this state
    pub created_at: Option<DateTime<Utc>>,
}

impl ClusterState {
    /// Create a fresh state for a new cluster
    pub fn new(name: impl Into<String>, cluster_id: impl Into<String>, init: InitConfig) -> Self {
        Self {
            name: name.into(),
            cluster_id: cluster_id.into(),
            init_config: Some(init),
            created_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Hosts for a role, in alias order
    pub fn hosts_for(&self, role: Role) -> &[ClusterHost] {
        self.hosts.get(&role).map(Vec::as_slice).unwrap_or_default()
    }

    /// Look up a host by alias across all roles
    pub fn find_host(&self, alias: &str) -> Option<&ClusterHost> {
        self.hosts.values().flatten().find(|h| h.alias == alias)
    }

    /// Append hosts to a role.
    ///
    /// A host whose alias already exists in the role is rejected: the stored
    /// record wins, so addresses never change after creation. Returns how
    /// many hosts were added.
    pub fn add_hosts(&mut self, role: Role, hosts: impl IntoIterator<Item = ClusterHost>) -> usize {
        let entry = self.hosts.entry(role).or_default();
        let mut added = 0;
        for host in hosts {
            if entry.iter().any(|h| h.alias == host.alias) {
                warn!(role = %role, alias = %host.alias, "Host alias already recorded, keeping existing entry");
                continue;
            }
            entry.push(host);
            added += 1;
        }
        added
    }

    /// Remove every host and add-on record (teardown)
    pub fn clear_hosts(&mut self) {
        self.hosts.clear();
        self.versions.clear();
        self.add_ons = AddOnStates::default();
    }

    /// Host used as the SSH gateway into the private network.
    ///
    /// The first control node if there is one, otherwise the first database
    /// node.
    pub fn gateway_host(&self) -> Option<&ClusterHost> {
        self.hosts_for(Role::Control)
            .first()
            .or_else(|| self.hosts_for(Role::Database).first())
    }

    /// Object-storage prefix for this cluster: `<name>-<cluster id>`
    pub fn object_prefix(&self) -> String {
        format!("{}-{}", self.name, self.cluster_id)
    }

    /// Record the version of a piece of software running on a host
    pub fn set_version(&mut self, alias: &str, software: &str, version: impl Into<String>) {
        self.versions
            .entry(alias.to_string())
            .or_default()
            .insert(software.to_string(), version.into());
    }
}

/// Loads and saves [`ClusterState`] in a working directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Store rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Working directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the state document
    pub fn path(&self) -> PathBuf {
        self.dir.join(STATE_FILE_NAME)
    }

    /// Whether a state document exists
    pub fn exists(&self) -> bool {
        self.path().is_file()
    }

    /// Load the state document
    pub fn load(&self) -> Result<ClusterState> {
        let path = self.path();
        if !path.is_file() {
            return Err(Error::StateNotFound { path });
        }
        let raw = fs::read_to_string(&path)
            .map_err(|e| Error::io(format!("failed to read {}", path.display()), e))?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::json(format!("failed to parse {}", path.display()), e))
    }

    /// Persist the state document atomically (temp file + rename)
    pub fn save(&self, state: &ClusterState) -> Result<()> {
        let path = self.path();
        let body = serde_json::to_string_pretty(state)
            .map_err(|e| Error::json("failed to serialize cluster state", e))?;
        atomic_write(&path, &body)?;
        debug!(cluster = %state.name, path = %path.display(), "Saved cluster state");
        Ok(())
    }

    /// Delete the state document if present
    pub fn clear(&self) -> Result<()> {
        let path = self.path();
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(format!("failed to remove {}", path.display()), e)),
        }
    }
}

/// Write `body` to `path` through a sibling temp file and a rename
pub fn atomic_write(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::io(format!("failed to create {}", parent.display()), e))?;
    }
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::validation(format!("invalid file path: {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.tmp.{}", file_name, std::process::id()));
    fs::write(&tmp, body)
        .map_err(|e| Error::io(format!("failed to write {}", tmp.display()), e))?;
    fs::rename(&tmp, path).map_err(|e| {
        Error::io(
            format!("failed to rename {} -> {}", tmp.display(), path.display()),
            e,
        )
    })
}
