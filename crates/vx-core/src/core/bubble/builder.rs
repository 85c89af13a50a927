//! The bubble build protocol: snapshot, stage, diff, materialize, verify,
//! restore main, commit. A KB claim key gives each `(name, version)` an
//! at-most-one concurrent builder; racing requests coalesce onto the
//! winner's result.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vx_domain::{scan_distributions, BubbleManifest, PackageSpec};

use super::diff::{diff_staged_files, is_native_file};
use super::materialize::materialize_files;
use super::verify::ImportVerifier;
use super::{bubble_dir, BubbleError, BubbleRecord, DEPS_FILE, MANIFEST_FILE};
use crate::core::cancel::CancelToken;
use crate::core::config::settings::InterpreterSettings;
use crate::core::fsutil;
use crate::core::installer::InstallerDriver;
use crate::core::kb::{keys, KnowledgeBase};

const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum BubbleOutcome {
    /// The bubble already existed (or a concurrent builder finished it).
    Existing(BubbleRecord),
    Built(BubbleRecord),
}

impl BubbleOutcome {
    pub fn record(&self) -> &BubbleRecord {
        match self {
            Self::Existing(record) | Self::Built(record) => record,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BuildClaim {
    pid: u32,
    started_at: String,
}

enum ClaimState {
    Ours,
    Wait,
    Done(BubbleRecord),
}

pub struct BubbleBuilder<'a> {
    pub settings: &'a InterpreterSettings,
    pub kb: &'a KnowledgeBase,
    pub driver: &'a InstallerDriver,
    pub interpreter_exe: &'a Path,
}

impl BubbleBuilder<'_> {
    /// Produce the bubble for `spec`, or return the existing one. The
    /// caller has already decided this version must live in a bubble
    /// (i.e. it differs from the active version).
    pub fn ensure_bubble(
        &self,
        spec: &PackageSpec,
        cancel: &CancelToken,
    ) -> Result<BubbleOutcome, BubbleError> {
        let record_key = keys::bubble(spec.name.as_str(), &spec.version.to_string());
        let claim_key = keys::bubble_build(spec.name.as_str(), &spec.version.to_string());

        if let Some(record) = self.kb.get_json::<BubbleRecord>(&record_key)? {
            return Ok(BubbleOutcome::Existing(record));
        }

        let wait_deadline = Instant::now() + self.settings.install_timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(BubbleError::Cancelled);
            }
            let takeover = Instant::now() >= wait_deadline;
            let state = self.kb.transaction(|tx| {
                if let Some(record) = tx.get_json::<BubbleRecord>(&record_key)? {
                    return Ok(ClaimState::Done(record));
                }
                match tx.get_json::<BuildClaim>(&claim_key)? {
                    Some(_claim) if !takeover => Ok(ClaimState::Wait),
                    _ => {
                        tx.put_json(
                            &claim_key,
                            &BuildClaim {
                                pid: std::process::id(),
                                started_at: fsutil::timestamp_rfc3339(),
                            },
                        )?;
                        Ok(ClaimState::Ours)
                    }
                }
            })?;
            match state {
                ClaimState::Done(record) => return Ok(BubbleOutcome::Existing(record)),
                ClaimState::Ours => break,
                ClaimState::Wait => thread::sleep(CLAIM_POLL_INTERVAL),
            }
        }

        let built = self.build(spec, cancel);
        match built {
            Ok(record) => Ok(BubbleOutcome::Built(record)),
            Err(err) => {
                // Release the claim so the next request can retry.
                if let Err(cleanup) = self.kb.delete(&claim_key) {
                    warn!(%cleanup, "failed to release build claim");
                }
                Err(err)
            }
        }
    }

    fn build(&self, spec: &PackageSpec, cancel: &CancelToken) -> Result<BubbleRecord, BubbleError> {
        let label = spec.bubble_label();
        debug!(%label, "building bubble");

        // 1. Snapshot the affected package states.
        let pre = vx_domain::package_map(&self.settings.install_root)
            .context("failed to scan main environment")
            .map_err(BubbleError::Io)?;
        if cancel.is_cancelled() {
            return Err(BubbleError::Cancelled);
        }

        // 2. Stage into a fresh temporary root.
        fs::create_dir_all(self.settings.staging_dir())
            .context("failed to create staging dir")
            .map_err(BubbleError::Io)?;
        let staging = tempfile::Builder::new()
            .prefix(&format!("{label}-"))
            .tempdir_in(self.settings.staging_dir())
            .context("failed to create staging root")
            .map_err(BubbleError::Io)?;
        self.driver
            .stage(&[spec.clone()], staging.path(), &pre, "stage")?;
        if cancel.is_cancelled() {
            return Err(BubbleError::Cancelled);
        }

        // 3. Decide which staged distributions enter the bubble: the
        // target, plus dependencies whose staged version differs from the
        // active one. Matching dependencies resolve from main at
        // activation time.
        let staged_dists = scan_distributions(staging.path())
            .context("failed to scan staged root")
            .map_err(BubbleError::Io)?;
        if !staged_dists.iter().any(|dist| dist.name == spec.name) {
            return Err(BubbleError::Corrupted {
                label: label.clone(),
                reason: "installer staged nothing for the target package".to_string(),
            });
        }

        let mut relative_paths: Vec<String> = Vec::new();
        let mut provided_modules: BTreeSet<String> = BTreeSet::new();
        let mut dependency_snapshot = std::collections::BTreeMap::new();
        for dist in &staged_dists {
            if dist.name != spec.name {
                dependency_snapshot
                    .insert(dist.name.as_str().to_string(), dist.version.to_string());
            }
            let include = dist.name == spec.name
                || pre.get(&dist.name) != Some(&dist.version);
            if !include {
                continue;
            }
            let mut rels = dist
                .record_paths()
                .context("failed to read staged RECORD")
                .map_err(BubbleError::Io)?;
            if rels.is_empty() {
                rels = walk_distribution_files(staging.path(), dist)?;
            }
            relative_paths.extend(rels);
            if dist.name == spec.name {
                for module in dist.top_level().unwrap_or_default() {
                    provided_modules.insert(module);
                }
            }
        }
        relative_paths.sort();
        relative_paths.dedup();

        let files = diff_staged_files(staging.path(), &self.settings.install_root, &relative_paths)
            .map_err(BubbleError::Io)?;
        if cancel.is_cancelled() {
            return Err(BubbleError::Cancelled);
        }

        // 4. Materialize. Native packages and the configured no-dedup list
        // always carry their own bytes.
        let is_native = files.iter().any(|file| is_native_file(&file.relative_path));
        let dedup_allowed = !is_native
            && !self
                .settings
                .native_package_list
                .contains(spec.name.as_str());
        let dir = bubble_dir(&self.settings.bubble_root, spec);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .context("failed to clear stale bubble dir")
                .map_err(BubbleError::Io)?;
        }
        fs::create_dir_all(&dir)
            .context("failed to create bubble dir")
            .map_err(BubbleError::Io)?;
        let (entries, stats) = materialize_files(
            &files,
            &self.settings.install_root,
            &dir,
            self.settings.dedup_policy,
            dedup_allowed,
        )
        .map_err(BubbleError::Io)?;

        // 5. Verify imports inside an isolated subprocess; targeted
        // repairs copy missing files from the stage root.
        let verifier = ImportVerifier {
            interpreter: self.interpreter_exe,
            main_root: &self.settings.install_root,
            staged_root: staging.path(),
        };
        let modules: Vec<String> = provided_modules.iter().cloned().collect();
        let outcome = verifier.verify(&dir, &modules, &spec.to_string())?;
        if !outcome.ok() {
            let failures = outcome
                .failures
                .iter()
                .map(|(module, class)| format!("{module}: {class:?}"))
                .collect::<Vec<_>>()
                .join("; ");
            fs::remove_dir_all(&dir).ok();
            return Err(BubbleError::VerificationFailed { label, failures });
        }

        // 6. Restore main: staging is isolated, so drift here means the
        // installer touched the shared root; put the snapshot back.
        self.restore_main(&pre)?;

        // Manifest + dependency snapshot land inside the bubble before the
        // KB commit, so a committed record always points at complete data.
        let mut manifest = BubbleManifest::new(
            spec.name.as_str(),
            &spec.version.to_string(),
            fsutil::timestamp_rfc3339(),
        );
        manifest.provided_modules = provided_modules.into_iter().collect();
        manifest.dependency_snapshot = dependency_snapshot;
        manifest.entries = entries;
        manifest.normalize();
        fsutil::atomic_write(&dir.join(MANIFEST_FILE), &manifest.render().map_err(|err| {
            BubbleError::Corrupted {
                label: spec.bubble_label(),
                reason: err.to_string(),
            }
        })?)
        .map_err(BubbleError::Io)?;
        fsutil::atomic_write(
            &dir.join(DEPS_FILE),
            &serde_json::to_string_pretty(&manifest.dependency_snapshot).map_err(|err| {
                BubbleError::Corrupted {
                    label: spec.bubble_label(),
                    reason: err.to_string(),
                }
            })?,
        )
        .map_err(BubbleError::Io)?;

        let record = BubbleRecord {
            package: spec.name.as_str().to_string(),
            version: spec.version.to_string(),
            root_path: dir.clone(),
            created_at: manifest.created_at.clone(),
            size_bytes: stats.bytes_total,
            deduped_bytes: stats.bytes_deduped,
            file_count: manifest.entries.len(),
            dependency_count: manifest.dependency_snapshot.len(),
        };

        // 7. Commit: record, version set, claim release, one transaction.
        let record_key = keys::bubble(spec.name.as_str(), &record.version);
        let claim_key = keys::bubble_build(spec.name.as_str(), &record.version);
        let versions_key = keys::pkg_versions(spec.name.as_str());
        self.kb.transaction(|tx| {
            tx.put_json(&record_key, &record)?;
            let mut versions: Vec<String> = tx.get_json(&versions_key)?.unwrap_or_default();
            if !versions.contains(&record.version) {
                versions.push(record.version.clone());
                versions.sort();
            }
            tx.put_json(&versions_key, &versions)?;
            tx.delete(&claim_key);
            Ok(())
        })?;
        debug!(%record.version, package = %record.package, saved = stats.bytes_deduped, "bubble committed");
        Ok(record)
    }

    /// Reverse any side-effects staging had on the main environment by
    /// reinstalling the pre-snapshot versions of drifted packages.
    fn restore_main(
        &self,
        pre: &std::collections::BTreeMap<vx_domain::CanonicalName, pep440_rs::Version>,
    ) -> Result<(), BubbleError> {
        let current = vx_domain::package_map(&self.settings.install_root)
            .context("failed to re-scan main environment")
            .map_err(BubbleError::Io)?;
        let mut to_restore = Vec::new();
        let mut to_remove = Vec::new();
        for (name, version) in pre {
            if current.get(name) != Some(version) {
                to_restore.push(PackageSpec::new(name.as_str(), version.clone()));
            }
        }
        for name in current.keys() {
            if !pre.contains_key(name) {
                to_remove.push(name.clone());
            }
        }
        if !to_remove.is_empty() {
            warn!(count = to_remove.len(), "staging leaked packages into main; removing");
            self.driver.uninstall(&to_remove, &self.settings.install_root)?;
        }
        if !to_restore.is_empty() {
            warn!(count = to_restore.len(), "staging drifted main packages; restoring");
            self.driver.stage(
                &to_restore,
                &self.settings.install_root,
                &current,
                "restore-main",
            )?;
        }
        Ok(())
    }
}

fn walk_distribution_files(
    staged_root: &Path,
    dist: &vx_domain::InstalledDist,
) -> Result<Vec<String>, BubbleError> {
    let mut rels = Vec::new();
    let mut roots: Vec<std::path::PathBuf> = vec![dist.dist_info.clone()];
    for module in dist.top_level().unwrap_or_default() {
        roots.push(staged_root.join(&module));
        roots.push(staged_root.join(format!("{module}.py")));
    }
    for root in roots {
        if root.is_file() {
            if let Ok(rel) = root.strip_prefix(staged_root) {
                rels.push(rel.display().to_string());
            }
            continue;
        }
        if !root.is_dir() {
            continue;
        }
        for entry in walkdir::WalkDir::new(&root).min_depth(1) {
            let entry = entry
                .context("failed to walk staged distribution")
                .map_err(BubbleError::Io)?;
            if entry.file_type().is_file() {
                if let Ok(rel) = entry.path().strip_prefix(staged_root) {
                    rels.push(rel.display().to_string());
                }
            }
        }
    }
    Ok(rels)
}
