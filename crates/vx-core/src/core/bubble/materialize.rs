//! Bubble materialization: copy bytes or record dedup references against
//! the main environment, per the configured policy.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;
use vx_domain::{EntryKind, ManifestEntry};

use super::diff::{FileDisposition, StagedFile};
use crate::core::config::settings::DedupPolicy;

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct MaterializeStats {
    pub files_copied: usize,
    pub refs_created: usize,
    pub bytes_total: u64,
    pub bytes_deduped: u64,
}

impl MaterializeStats {
    pub fn bytes_saved(&self) -> u64 {
        self.bytes_deduped
    }
}

/// Lay the classified files down inside `bubble_dir`. `dedup_allowed` is
/// false for native packages and names on the no-dedup list; such packages
/// always carry self-contained bytes.
pub fn materialize_files(
    files: &[StagedFile],
    main_root: &Path,
    bubble_dir: &Path,
    policy: DedupPolicy,
    dedup_allowed: bool,
) -> Result<(Vec<ManifestEntry>, MaterializeStats)> {
    let mut entries = Vec::with_capacity(files.len());
    let mut stats = MaterializeStats::default();

    for file in files {
        let target = bubble_dir.join(&file.relative_path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let dedup_eligible = dedup_allowed
            && policy != DedupPolicy::Off
            && file.disposition == FileDisposition::Identical;

        let kind = if dedup_eligible {
            let main_path = main_root.join(&file.relative_path);
            match policy {
                DedupPolicy::Aggressive => {
                    link_symbolic(&main_path, &target)?;
                    EntryKind::Symlink
                }
                DedupPolicy::Conservative => {
                    if fs::hard_link(&main_path, &target).is_ok() {
                        EntryKind::DedupRef
                    } else {
                        // Cross-device: fall back to a plain copy.
                        fs::copy(&file.staged_path, &target).with_context(|| {
                            format!("failed to copy {}", file.staged_path.display())
                        })?;
                        EntryKind::File
                    }
                }
                DedupPolicy::Off => unreachable!("filtered above"),
            }
        } else {
            fs::copy(&file.staged_path, &target)
                .with_context(|| format!("failed to copy {}", file.staged_path.display()))?;
            EntryKind::File
        };

        stats.bytes_total += file.size;
        match kind {
            EntryKind::File => stats.files_copied += 1,
            EntryKind::Symlink | EntryKind::DedupRef => {
                stats.refs_created += 1;
                stats.bytes_deduped += file.size;
            }
        }
        entries.push(ManifestEntry {
            relative_path: file.relative_path.clone(),
            kind,
            sha256: file.sha256.clone(),
            size: file.size,
        });
    }

    debug!(
        copied = stats.files_copied,
        refs = stats.refs_created,
        saved = stats.bytes_deduped,
        "materialized bubble files"
    );
    Ok((entries, stats))
}

#[cfg(unix)]
fn link_symbolic(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)
        .with_context(|| format!("failed to symlink {}", link.display()))
}

#[cfg(windows)]
fn link_symbolic(target: &Path, link: &Path) -> Result<()> {
    std::os::windows::fs::symlink_file(target, link)
        .with_context(|| format!("failed to symlink {}", link.display()))
}
