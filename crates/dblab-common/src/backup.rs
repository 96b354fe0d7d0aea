//! Incremental, content-hash based backup of working-directory files.
//!
//! Each [`BackupTarget`] is hashed (SHA-256 over file bytes, or over the
//! sorted `(relative path, file hash)` pairs of a directory) and compared with
//! the digest recorded in [`ClusterState::backup_hashes`]. Only targets whose
//! digest changed, or that were never hashed, are uploaded. Running a backup
//! after every command is therefore free when nothing changed.
//!
//! Backup failures are never fatal: they are logged and reported in the
//! [`BackupReport`], and the calling command carries on.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::state::ClusterState;
use crate::{Error, Result};

/// Object storage as seen by backup and restore.
///
/// Keys are relative to the bucket the implementation was built for.
#[cfg_attr(test, mockall::automock)]
pub trait ObjectStore: Send + Sync {
    /// Upload one file to `key`
    fn upload_file(&self, local: &Path, key: &str) -> Result<()>;

    /// Upload a directory tree under `prefix`
    fn upload_directory(&self, local: &Path, prefix: &str) -> Result<()>;

    /// Download `key` to a local file
    fn download_file(&self, key: &str, local: &Path) -> Result<()>;

    /// Download everything under `prefix` into a local directory
    fn download_directory(&self, prefix: &str, local: &Path) -> Result<()>;

    /// Whether an object (or, for a prefix ending in `/`, any object under it) exists
    fn exists(&self, key: &str) -> Result<bool>;
}

/// A named file or directory in the working directory that gets backed up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupTarget {
    /// Key into `backup_hashes`
    pub name: String,
    /// Path relative to the working directory
    pub local_path: PathBuf,
    /// Object key relative to the cluster prefix
    pub remote_path: String,
    /// Whether the target is a directory
    pub is_directory: bool,
    /// The target is the state document holding the hashes themselves; its
    /// digest ignores the `backupHashes` field
    pub records_hashes: bool,
}

impl BackupTarget {
    /// A single-file target
    pub fn file(name: &str, local_path: &str, remote_path: &str) -> Self {
        Self {
            name: name.to_string(),
            local_path: PathBuf::from(local_path),
            remote_path: remote_path.to_string(),
            is_directory: false,
            records_hashes: false,
        }
    }

    /// The state document target
    pub fn state_document(name: &str, local_path: &str, remote_path: &str) -> Self {
        Self {
            records_hashes: true,
            ..Self::file(name, local_path, remote_path)
        }
    }

    /// A directory target
    pub fn directory(name: &str, local_path: &str, remote_path: &str) -> Self {
        Self {
            name: name.to_string(),
            local_path: PathBuf::from(local_path),
            remote_path: remote_path.to_string(),
            is_directory: true,
            records_hashes: false,
        }
    }

    /// Object key for this target under the cluster prefix
    pub fn object_key(&self, state: &ClusterState) -> String {
        format!("{}/{}", state.object_prefix(), self.remote_path)
    }

    /// Hash of the local content, `None` if it does not exist
    pub fn local_hash(&self, base_dir: &Path) -> Result<Option<String>> {
        let path = base_dir.join(&self.local_path);
        if self.is_directory {
            if !path.is_dir() {
                return Ok(None);
            }
            hash_directory(&path).map(Some)
        } else {
            if !path.is_file() {
                return Ok(None);
            }
            if self.records_hashes {
                return hash_state_document(&path).map(Some);
            }
            hash_file(&path).map(Some)
        }
    }
}

/// The fixed, ordered list of targets backed up for every cluster
pub fn default_targets() -> Vec<BackupTarget> {
    vec![
        BackupTarget::state_document("state", "state.json", "config/state.json"),
        BackupTarget::file("kubeconfig", "kubeconfig", "k8s/kubeconfig"),
        BackupTarget::directory("cassandra-config", "cassandra", "config/cassandra/"),
        BackupTarget::file("ssh-config", "sshConfig", "config/sshConfig"),
        BackupTarget::file("environment", "env.sh", "config/env.sh"),
    ]
}

/// Hex SHA-256 of a state document with its `backupHashes` field removed.
///
/// Recording a new hash rewrites the document; excluding the field keeps that
/// write from looking like a content change on the next pass. A file that is
/// not a JSON object is hashed byte for byte.
pub fn hash_state_document(path: &Path) -> Result<String> {
    let raw = std::fs::read(path)
        .map_err(|e| Error::io(format!("failed to read {}", path.display()), e))?;
    let mut value: serde_json::Value = match serde_json::from_slice(&raw) {
        Ok(value @ serde_json::Value::Object(_)) => value,
        _ => return hash_file(path),
    };
    if let Some(object) = value.as_object_mut() {
        object.remove("backupHashes");
    }
    let canonical = serde_json::to_vec(&value)
        .map_err(|e| Error::json(format!("failed to canonicalize {}", path.display()), e))?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

/// Hex SHA-256 of a file's bytes
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .map_err(|e| Error::io(format!("failed to open {}", path.display()), e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::io(format!("failed to read {}", path.display()), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-256 over the sorted `(relative path, file hash)` pairs of a tree.
///
/// Independent of filesystem iteration order; relative paths always use `/`.
pub fn hash_directory(root: &Path) -> Result<String> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            Error::io(
                format!("failed to walk {}", root.display()),
                e.into_io_error()
                    .unwrap_or_else(|| io::Error::other("directory loop")),
            )
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| Error::validation(format!("{} escaped {}", entry.path().display(), root.display())))?;
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        entries.push((relative, hash_file(entry.path())?));
    }
    entries.sort();

    let mut hasher = Sha256::new();
    for (relative, digest) in &entries {
        hasher.update(relative.as_bytes());
        hasher.update([0u8]);
        hasher.update(digest.as_bytes());
        hasher.update(b"\n");
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Outcome of one backup pass.
#[derive(Debug, Default)]
pub struct BackupReport {
    /// Targets uploaded because their content changed
    pub uploaded: Vec<String>,
    /// Targets unchanged or absent locally
    pub skipped: Vec<String>,
    /// Targets that failed, with the reason
    pub failed: Vec<Error>,
}

impl BackupReport {
    /// Whether anything was uploaded
    pub fn changed(&self) -> bool {
        !self.uploaded.is_empty()
    }
}

/// Upload every target whose content hash differs from the recorded one.
///
/// Records new hashes in `state.backup_hashes`; the caller saves the state.
/// Never fails: per-target problems end up in [`BackupReport::failed`].
pub fn backup_changed(
    state: &mut ClusterState,
    store: &dyn ObjectStore,
    base_dir: &Path,
    targets: &[BackupTarget],
) -> BackupReport {
    let mut report = BackupReport::default();

    for target in targets {
        let hash = match target.local_hash(base_dir) {
            Ok(Some(hash)) => hash,
            Ok(None) => {
                debug!(target = %target.name, "Backup target missing locally, skipping");
                report.skipped.push(target.name.clone());
                continue;
            }
            Err(e) => {
                warn!(target = %target.name, error = %e, "Failed to hash backup target");
                report.failed.push(Error::backup(&target.name, e.to_string()));
                continue;
            }
        };

        if state.backup_hashes.get(&target.name) == Some(&hash) {
            debug!(target = %target.name, "Backup target unchanged");
            report.skipped.push(target.name.clone());
            continue;
        }

        let local = base_dir.join(&target.local_path);
        let key = target.object_key(state);
        let uploaded = if target.is_directory {
            store.upload_directory(&local, &key)
        } else {
            store.upload_file(&local, &key)
        };

        match uploaded {
            Ok(()) => {
                info!(target = %target.name, key = %key, "Backed up changed target");
                state.backup_hashes.insert(target.name.clone(), hash);
                report.uploaded.push(target.name.clone());
            }
            Err(e) => {
                warn!(target = %target.name, error = %e, "Backup upload failed");
                report.failed.push(Error::backup(&target.name, e.to_string()));
            }
        }
    }

    report
}

/// Download every target that exists in object storage into `base_dir`.
///
/// Returns the names of restored targets. Recorded hashes are left alone so
/// the next backup pass re-establishes them from the restored content.
pub fn restore_targets(
    state: &ClusterState,
    store: &dyn ObjectStore,
    base_dir: &Path,
    targets: &[BackupTarget],
) -> Result<Vec<String>> {
    let mut restored = Vec::new();
    for target in targets {
        let key = target.object_key(state);
        if !store.exists(&key)? {
            debug!(target = %target.name, key = %key, "Nothing to restore");
            continue;
        }
        let local = base_dir.join(&target.local_path);
        if target.is_directory {
            store.download_directory(&key, &local)?;
        } else {
            store.download_file(&key, &local)?;
        }
        info!(target = %target.name, "Restored from backup");
        restored.push(target.name.clone());
    }
    Ok(restored)
}
