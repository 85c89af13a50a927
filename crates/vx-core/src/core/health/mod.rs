//! KB ↔ filesystem reconciliation: find orphan bubbles, flag ghosts,
//! verify manifests, rebuild the KB from disk.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, warn};
use vx_domain::{package_map, BubbleManifest, EntryKind};

use crate::core::bubble::{BubbleRecord, MANIFEST_FILE};
use crate::core::config::settings::InterpreterSettings;
use crate::core::fsutil;
use crate::core::kb::{keys, KnowledgeBase};

#[derive(Clone, Debug, Default, Serialize)]
pub struct BubbleScanReport {
    pub bubbles_on_disk: usize,
    pub orphans_registered: Vec<String>,
    pub ghosts_removed: Vec<String>,
    pub unreadable: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct BubbleVerifyReport {
    pub label: String,
    pub entries: usize,
    pub missing: Vec<String>,
    pub drifted: Vec<String>,
}

impl BubbleVerifyReport {
    pub fn ok(&self) -> bool {
        self.missing.is_empty() && self.drifted.is_empty()
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct RebuildReport {
    pub packages: usize,
    pub bubbles: usize,
}

/// Enumerate bubble roots on disk, cross-check KB entries, register
/// orphans and drop ghosts.
pub fn scan_bubbles(
    kb: &KnowledgeBase,
    settings: &InterpreterSettings,
) -> Result<BubbleScanReport> {
    let mut report = BubbleScanReport::default();
    let mut on_disk: Vec<(String, String, BubbleRecord)> = Vec::new();

    if settings.bubble_root.is_dir() {
        for entry in fs::read_dir(&settings.bubble_root)
            .with_context(|| format!("failed to read {}", settings.bubble_root.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir = entry.path();
            match read_bubble_record(&dir) {
                Ok(Some(record)) => {
                    report.bubbles_on_disk += 1;
                    on_disk.push((record.package.clone(), record.version.clone(), record));
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(dir = %dir.display(), %err, "unreadable bubble");
                    report
                        .unreadable
                        .push(dir.file_name().unwrap_or_default().to_string_lossy().to_string());
                }
            }
        }
    }

    // Orphans: on disk, unknown to the KB.
    for (package, version, record) in &on_disk {
        let key = keys::bubble(package, version);
        if kb.get_json::<BubbleRecord>(&key)?.is_none() {
            debug!(package, version, "registering orphan bubble");
            let versions_key = keys::pkg_versions(package);
            kb.transaction(|tx| {
                tx.put_json(&key, record)?;
                let mut versions: Vec<String> = tx.get_json(&versions_key)?.unwrap_or_default();
                if !versions.contains(version) {
                    versions.push(version.clone());
                    versions.sort();
                }
                tx.put_json(&versions_key, &versions)?;
                Ok(())
            })?;
            report.orphans_registered.push(format!("{package}-{version}"));
        }
    }

    // Ghosts: in the KB, gone from disk.
    for key in kb.scan(keys::BUBBLE_PREFIX)? {
        if key.ends_with(":build") {
            continue;
        }
        let Some(record) = kb.get_json::<BubbleRecord>(&key)? else {
            continue;
        };
        if !record.root_path.join(MANIFEST_FILE).exists() {
            warn!(package = %record.package, version = %record.version, "removing ghost bubble record");
            let versions_key = keys::pkg_versions(&record.package);
            let version = record.version.clone();
            kb.transaction(|tx| {
                tx.delete(&key);
                let mut versions: Vec<String> = tx.get_json(&versions_key)?.unwrap_or_default();
                versions.retain(|v| v != &version);
                tx.put_json(&versions_key, &versions)?;
                Ok(())
            })?;
            report
                .ghosts_removed
                .push(format!("{}-{}", record.package, record.version));
        }
    }
    Ok(report)
}

/// Re-hash every manifest entry of one bubble and report drift.
pub fn verify_bubble(settings: &InterpreterSettings, name: &str, version: &str) -> Result<BubbleVerifyReport> {
    let label = format!("{name}-{version}");
    let dir = settings.bubble_root.join(&label);
    let manifest_path = dir.join(MANIFEST_FILE);
    let raw = fs::read_to_string(&manifest_path)
        .with_context(|| format!("failed to read {}", manifest_path.display()))?;
    let manifest = BubbleManifest::parse(&raw)?;

    let mut report = BubbleVerifyReport {
        label,
        entries: manifest.entries.len(),
        ..BubbleVerifyReport::default()
    };
    for entry in &manifest.entries {
        let path = dir.join(&entry.relative_path);
        let exists = match entry.kind {
            EntryKind::Symlink => path.symlink_metadata().is_ok() && path.exists(),
            _ => path.is_file(),
        };
        if !exists {
            report.missing.push(entry.relative_path.clone());
            continue;
        }
        let actual = fsutil::sha256_file(&path)?;
        if actual != entry.sha256 {
            report.drifted.push(entry.relative_path.clone());
        }
    }
    Ok(report)
}

/// Re-hash a random subset of registered bubbles; cheap spot-check for
/// large installations. Returns the labels that failed verification.
pub fn verify_sample(
    kb: &KnowledgeBase,
    settings: &InterpreterSettings,
    sample: usize,
) -> Result<Vec<String>> {
    use rand::seq::IteratorRandom;

    let mut candidates = Vec::new();
    for key in kb.scan(keys::BUBBLE_PREFIX)? {
        if key.ends_with(":build") {
            continue;
        }
        if let Some(record) = kb.get_json::<BubbleRecord>(&key)? {
            candidates.push((record.package, record.version));
        }
    }
    let mut rng = rand::thread_rng();
    let picked = candidates
        .into_iter()
        .choose_multiple(&mut rng, sample);

    let mut failures = Vec::new();
    for (package, version) in picked {
        let report = verify_bubble(settings, &package, &version)?;
        if !report.ok() {
            failures.push(report.label);
        }
    }
    Ok(failures)
}

/// Discard all KB state and reconstruct it from the filesystem.
pub fn rebuild_kb(kb: &KnowledgeBase, settings: &InterpreterSettings) -> Result<RebuildReport> {
    kb.reset()?;
    let mut report = RebuildReport::default();

    for (name, version) in package_map(&settings.install_root)? {
        let versions_key = keys::pkg_versions(name.as_str());
        let active_key = keys::pkg_active(name.as_str());
        let version = version.to_string();
        kb.transaction(|tx| {
            tx.put(&active_key, version.clone());
            let mut versions: Vec<String> = tx.get_json(&versions_key)?.unwrap_or_default();
            if !versions.contains(&version) {
                versions.push(version.clone());
                versions.sort();
            }
            tx.put_json(&versions_key, &versions)?;
            Ok(())
        })?;
        report.packages += 1;
    }

    let scan = scan_bubbles(kb, settings)?;
    report.bubbles = scan.bubbles_on_disk;
    Ok(report)
}

fn read_bubble_record(dir: &Path) -> Result<Option<BubbleRecord>> {
    let manifest_path = dir.join(MANIFEST_FILE);
    if !manifest_path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&manifest_path)
        .with_context(|| format!("failed to read {}", manifest_path.display()))?;
    let manifest = BubbleManifest::parse(&raw)
        .with_context(|| format!("failed to parse {}", manifest_path.display()))?;
    Ok(Some(BubbleRecord {
        package: manifest.package.clone(),
        version: manifest.version.clone(),
        root_path: dir.to_path_buf(),
        created_at: manifest.created_at.clone(),
        size_bytes: manifest.total_bytes(),
        deduped_bytes: manifest.deduped_bytes(),
        file_count: manifest.entries.len(),
        dependency_count: manifest.dependency_snapshot.len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::settings::KbBackendChoice;
    use vx_domain::ManifestEntry;

    fn settings(temp: &Path) -> InterpreterSettings {
        let mut settings = InterpreterSettings::defaults("3.11", &temp.join("site"));
        settings.bubble_root = temp.join("bubbles");
        settings.state_root = temp.join("state");
        settings.kb_backend = KbBackendChoice::Embedded;
        fs::create_dir_all(&settings.install_root).unwrap();
        fs::create_dir_all(&settings.bubble_root).unwrap();
        settings
    }

    fn kb(settings: &InterpreterSettings) -> KnowledgeBase {
        KnowledgeBase::open(settings).unwrap()
    }

    fn plant_bubble(settings: &InterpreterSettings, name: &str, version: &str) {
        let dir = settings.bubble_root.join(format!("{name}-{version}"));
        fs::create_dir_all(dir.join(name)).unwrap();
        fs::write(dir.join(name).join("__init__.py"), "x = 1\n").unwrap();
        let mut manifest = BubbleManifest::new(name, version, "2026-01-01T00:00:00Z".into());
        manifest.provided_modules.push(name.to_string());
        manifest.push_entry(ManifestEntry {
            relative_path: format!("{name}/__init__.py"),
            kind: EntryKind::File,
            sha256: fsutil::sha256_bytes(b"x = 1\n"),
            size: 6,
        });
        manifest.normalize();
        fs::write(dir.join(MANIFEST_FILE), manifest.render().unwrap()).unwrap();
    }

    #[test]
    fn orphan_bubbles_are_registered() {
        let temp = tempfile::tempdir().unwrap();
        let settings = settings(temp.path());
        let kb = kb(&settings);
        plant_bubble(&settings, "rich", "10.0.0");

        let report = scan_bubbles(&kb, &settings).unwrap();
        assert_eq!(report.orphans_registered, vec!["rich-10.0.0"]);
        let record: BubbleRecord = kb
            .get_json(&keys::bubble("rich", "10.0.0"))
            .unwrap()
            .unwrap();
        assert_eq!(record.file_count, 1);
        let versions: Vec<String> = kb.get_json(&keys::pkg_versions("rich")).unwrap().unwrap();
        assert_eq!(versions, vec!["10.0.0"]);
    }

    #[test]
    fn ghost_records_are_removed() {
        let temp = tempfile::tempdir().unwrap();
        let settings = settings(temp.path());
        let kb = kb(&settings);
        let record = BubbleRecord {
            package: "ghost".into(),
            version: "1.0".into(),
            root_path: settings.bubble_root.join("ghost-1.0"),
            created_at: "2026-01-01T00:00:00Z".into(),
            size_bytes: 0,
            deduped_bytes: 0,
            file_count: 0,
            dependency_count: 0,
        };
        kb.put_json(&keys::bubble("ghost", "1.0"), &record).unwrap();
        kb.put_json(&keys::pkg_versions("ghost"), &vec!["1.0".to_string()])
            .unwrap();

        let report = scan_bubbles(&kb, &settings).unwrap();
        assert_eq!(report.ghosts_removed, vec!["ghost-1.0"]);
        assert!(kb
            .get_json::<BubbleRecord>(&keys::bubble("ghost", "1.0"))
            .unwrap()
            .is_none());
        let versions: Vec<String> = kb.get_json(&keys::pkg_versions("ghost")).unwrap().unwrap();
        assert!(versions.is_empty());
    }

    #[test]
    fn verify_bubble_detects_drift_and_missing() {
        let temp = tempfile::tempdir().unwrap();
        let settings = settings(temp.path());
        plant_bubble(&settings, "rich", "10.0.0");

        let clean = verify_bubble(&settings, "rich", "10.0.0").unwrap();
        assert!(clean.ok());

        let target = settings.bubble_root.join("rich-10.0.0/rich/__init__.py");
        fs::write(&target, "tampered\n").unwrap();
        let drifted = verify_bubble(&settings, "rich", "10.0.0").unwrap();
        assert_eq!(drifted.drifted, vec!["rich/__init__.py"]);

        fs::remove_file(&target).unwrap();
        let missing = verify_bubble(&settings, "rich", "10.0.0").unwrap();
        assert_eq!(missing.missing, vec!["rich/__init__.py"]);
    }

    #[test]
    fn verify_sample_reports_failures() {
        let temp = tempfile::tempdir().unwrap();
        let settings = settings(temp.path());
        let kb = kb(&settings);
        plant_bubble(&settings, "rich", "10.0.0");
        scan_bubbles(&kb, &settings).unwrap();

        assert!(verify_sample(&kb, &settings, 5).unwrap().is_empty());

        fs::write(
            settings.bubble_root.join("rich-10.0.0/rich/__init__.py"),
            "tampered\n",
        )
        .unwrap();
        let failures = verify_sample(&kb, &settings, 5).unwrap();
        assert_eq!(failures, vec!["rich-10.0.0"]);
    }

    #[test]
    fn rebuild_reconstructs_from_disk() {
        let temp = tempfile::tempdir().unwrap();
        let settings = settings(temp.path());
        let kb = kb(&settings);

        let dist_info = settings.install_root.join("flask-2.0.1.dist-info");
        fs::create_dir_all(&dist_info).unwrap();
        fs::write(
            dist_info.join("METADATA"),
            "Metadata-Version: 2.1\nName: flask\nVersion: 2.0.1\n",
        )
        .unwrap();
        plant_bubble(&settings, "flask", "1.1.4");
        kb.put("pkg:stale:active", "9.9").unwrap();

        let report = rebuild_kb(&kb, &settings).unwrap();
        assert_eq!(report.packages, 1);
        assert_eq!(report.bubbles, 1);
        assert!(kb.get("pkg:stale:active").unwrap().is_none());
        assert_eq!(kb.get(&keys::pkg_active("flask")).unwrap().unwrap(), "2.0.1");
        let versions: Vec<String> = kb.get_json(&keys::pkg_versions("flask")).unwrap().unwrap();
        assert_eq!(versions, vec!["1.1.4".to_string(), "2.0.1".to_string()]);
    }
}
