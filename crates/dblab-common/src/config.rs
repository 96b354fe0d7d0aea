//! User profile stored at `~/.dblab/`.
//!
//! The profile holds per-user settings that every cluster reuses: cloud
//! region and credentials profile, the SSH key pair, and default instance
//! shapes.
//!
//! The profile directory resolution chain (highest priority first):
//! 1. Explicit `--profile-dir` flag
//! 2. `DBLAB_PROFILE_DIR` environment variable
//! 3. `~/.dblab`

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::state::atomic_write;
use crate::{Error, Result};

const PROFILE_DIR_NAME: &str = ".dblab";
const PROFILE_FILE_NAME: &str = "profile.json";
/// Environment variable overriding the profile directory
pub const PROFILE_DIR_ENV: &str = "DBLAB_PROFILE_DIR";

/// Per-user settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserConfig {
    /// Cloud region
    pub region: String,
    /// Named AWS credentials profile (`None` uses the default chain)
    pub aws_profile: Option<String>,
    /// Login user on provisioned hosts
    pub ssh_user: String,
    /// Private key used for every SSH connection
    pub ssh_key_path: Option<PathBuf>,
    /// Cloud key-pair name matching `ssh_key_path`
    pub key_pair_name: Option<String>,
    /// Default machine image
    pub ami: Option<String>,
    /// Default database instance type
    pub db_instance_type: String,
    /// Default load-generator instance type
    pub stress_instance_type: String,
    /// Default control instance type
    pub control_instance_type: String,
    /// Bucket used for cluster backups
    pub bucket: Option<String>,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            region: "us-west-2".to_string(),
            aws_profile: None,
            ssh_user: "ubuntu".to_string(),
            ssh_key_path: None,
            key_pair_name: None,
            ami: None,
            db_instance_type: "r5d.xlarge".to_string(),
            stress_instance_type: "c5.2xlarge".to_string(),
            control_instance_type: "m5.xlarge".to_string(),
            bucket: None,
        }
    }
}

/// Resolve the profile directory using the priority chain
pub fn resolve_profile_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(PROFILE_DIR_ENV) {
        if !path.is_empty() {
            return Ok(PathBuf::from(path));
        }
    }

    let home = dirs::home_dir()
        .ok_or_else(|| Error::validation("could not determine home directory"))?;
    Ok(home.join(PROFILE_DIR_NAME))
}

/// Path to `profile.json` inside a profile directory
pub fn profile_path(dir: &Path) -> PathBuf {
    dir.join(PROFILE_FILE_NAME)
}

/// Load the profile, returning defaults if it does not exist
pub fn load_profile(dir: &Path) -> Result<UserConfig> {
    let path = profile_path(dir);
    if !path.exists() {
        return Ok(UserConfig::default());
    }
    let data = fs::read_to_string(&path)
        .map_err(|e| Error::io(format!("failed to read {}", path.display()), e))?;
    serde_json::from_str(&data)
        .map_err(|e| Error::json(format!("failed to parse {}", path.display()), e))
}

/// Save the profile
pub fn save_profile(dir: &Path, config: &UserConfig) -> Result<()> {
    let data = serde_json::to_string_pretty(config)
        .map_err(|e| Error::json("failed to serialize profile", e))?;
    atomic_write(&profile_path(dir), &data)
}
