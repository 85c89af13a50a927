//! Bubble manager: per-version isolated package directories overlaying the
//! shared main environment.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vx_domain::PackageSpec;

use crate::core::installer::InstallerError;
use crate::core::kb::KbError;

pub(crate) mod builder;
pub(crate) mod diff;
pub(crate) mod materialize;
pub(crate) mod verify;

pub use builder::{BubbleBuilder, BubbleOutcome};
pub use materialize::MaterializeStats;

/// Machine-readable manifest inside every bubble directory.
pub const MANIFEST_FILE: &str = ".vx-manifest.json";
/// Dependency snapshot inside every bubble directory.
pub const DEPS_FILE: &str = ".vx-deps.json";

pub fn bubble_dir(bubble_root: &Path, spec: &PackageSpec) -> PathBuf {
    bubble_root.join(spec.bubble_label())
}

/// KB record for a committed bubble (`bubble:<name>:<version>`).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BubbleRecord {
    pub package: String,
    pub version: String,
    pub root_path: PathBuf,
    pub created_at: String,
    pub size_bytes: u64,
    pub deduped_bytes: u64,
    pub file_count: usize,
    pub dependency_count: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum BubbleError {
    #[error("[VX400] bubble {label} failed import verification: {failures}")]
    VerificationFailed { label: String, failures: String },
    #[error("[VX401] bubble {label} is corrupted: {reason}")]
    Corrupted { label: String, reason: String },
    #[error("[VX900] operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Installer(#[from] InstallerError),
    #[error(transparent)]
    Kb(#[from] KbError),
    #[error("[VX200] {0}")]
    Io(#[from] anyhow::Error),
}
