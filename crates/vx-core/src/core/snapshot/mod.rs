//! Snapshot engine: cheap captures of the main environment's package map,
//! stored append-only as one JSON file per snapshot.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::debug;
use vx_domain::{package_map, EnvSnapshot, LAST_GOOD_SNAPSHOT_ID};

use crate::core::fsutil;

pub(crate) mod revert;

pub use revert::{plan_revert, RevertAction};

/// Installer lock files whose digest is recorded alongside a capture.
const LOCKFILE_CANDIDATES: &[&str] = &["uv.lock", "poetry.lock", "requirements.lock"];

#[derive(Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Capture the current environment state. The snapshot is not yet
    /// persisted; callers decide between [`Self::save_new`] and
    /// [`Self::save_last_good`].
    pub fn capture(&self, interpreter_version: &str, install_root: &Path) -> Result<EnvSnapshot> {
        let mut snapshot = EnvSnapshot::new(
            self.fresh_id(),
            interpreter_version.to_string(),
            fsutil::timestamp_rfc3339(),
        );
        for (name, version) in package_map(install_root)? {
            snapshot
                .packages
                .insert(name.as_str().to_string(), version.to_string());
        }
        snapshot.lock_digest = lockfile_digest(install_root)?;
        Ok(snapshot)
    }

    /// Persist a snapshot under its own id. Snapshots are append-only:
    /// overwriting an existing id is an error.
    pub fn save_new(&self, snapshot: &EnvSnapshot) -> Result<PathBuf> {
        let path = self.path_for(&snapshot.id);
        if path.exists() {
            return Err(anyhow!("snapshot {} already exists", snapshot.id));
        }
        fsutil::atomic_write(&path, &snapshot.render()?)?;
        debug!(id = %snapshot.id, "saved snapshot");
        Ok(path)
    }

    /// Rewrite the reserved `last-good` snapshot after a successful
    /// mutation. This is the one id that is not append-only.
    pub fn save_last_good(&self, snapshot: &EnvSnapshot) -> Result<PathBuf> {
        let mut snapshot = snapshot.clone();
        snapshot.id = LAST_GOOD_SNAPSHOT_ID.to_string();
        let path = self.path_for(LAST_GOOD_SNAPSHOT_ID);
        fsutil::atomic_write(&path, &snapshot.render()?)?;
        Ok(path)
    }

    pub fn load(&self, id: &str) -> Result<Option<EnvSnapshot>> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Some(EnvSnapshot::parse(&raw)?))
    }

    pub fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        if !self.dir.exists() {
            return Ok(ids);
        }
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read {}", self.dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn fresh_id(&self) -> String {
        let stamp = fsutil::timestamp_compact();
        for seq in 0.. {
            let id = format!("st-{stamp}-{seq:04}");
            if !self.path_for(&id).exists() {
                return id;
            }
        }
        unreachable!("snapshot id space exhausted")
    }
}

fn lockfile_digest(install_root: &Path) -> Result<Option<String>> {
    for candidate in LOCKFILE_CANDIDATES {
        let path = install_root.join(candidate);
        if path.is_file() {
            return Ok(Some(fsutil::sha256_file(&path)?));
        }
    }
    Ok(None)
}
