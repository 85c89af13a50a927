use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use pep440_rs::Version;

use crate::name::CanonicalName;

/// One installed distribution discovered by scanning a package root for
/// `*.dist-info` directories.
#[derive(Clone, Debug)]
pub struct InstalledDist {
    pub name: CanonicalName,
    pub raw_name: String,
    pub version: Version,
    pub dist_info: PathBuf,
}

impl InstalledDist {
    /// Relative paths recorded in the distribution's RECORD file, if any.
    pub fn record_paths(&self) -> Result<Vec<String>> {
        let record = self.dist_info.join("RECORD");
        if !record.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&record)
            .with_context(|| format!("failed to read {}", record.display()))?;
        let mut paths = Vec::new();
        for line in contents.lines() {
            let Some(path) = line.split(',').next() else {
                continue;
            };
            let path = path.trim();
            if !path.is_empty() && !path.starts_with("..") {
                paths.push(path.to_string());
            }
        }
        Ok(paths)
    }

    /// Top-level importable module names this distribution provides.
    pub fn top_level(&self) -> Result<Vec<String>> {
        top_level_modules(&self.dist_info, &self.name)
    }
}

/// Read `top_level.txt`, falling back to the filesystem name of the package
/// when the distribution does not ship one.
pub fn top_level_modules(dist_info: &Path, name: &CanonicalName) -> Result<Vec<String>> {
    let top_level = dist_info.join("top_level.txt");
    if top_level.exists() {
        let contents = fs::read_to_string(&top_level)
            .with_context(|| format!("failed to read {}", top_level.display()))?;
        let modules: Vec<String> = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToString::to_string)
            .collect();
        if !modules.is_empty() {
            return Ok(modules);
        }
    }
    Ok(vec![name.filesystem_name()])
}

/// Enumerate every distribution under `root` (non-recursive; dist-info dirs
/// live directly inside a package directory).
pub fn scan_distributions(root: &Path) -> Result<Vec<InstalledDist>> {
    let mut dists = Vec::new();
    if !root.is_dir() {
        return Ok(dists);
    }
    for entry in
        fs::read_dir(root).with_context(|| format!("failed to read {}", root.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        let Some(dir_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !path.is_dir() || !dir_name.ends_with(".dist-info") {
            continue;
        }
        // A single unreadable dist-info must not hide the rest of the
        // environment.
        if let Ok(Some(dist)) = read_dist_info(&path) {
            dists.push(dist);
        }
    }
    dists.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(dists)
}

/// Canonical name → version for every distribution under `root`.
pub fn package_map(root: &Path) -> Result<BTreeMap<CanonicalName, Version>> {
    let mut map = BTreeMap::new();
    for dist in scan_distributions(root)? {
        map.insert(dist.name, dist.version);
    }
    Ok(map)
}

fn read_dist_info(dist_info: &Path) -> Result<Option<InstalledDist>> {
    let metadata = dist_info.join("METADATA");
    if !metadata.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(&metadata)
        .with_context(|| format!("failed to read {}", metadata.display()))?;
    let mut raw_name = None;
    let mut version = None;
    for line in contents.lines() {
        if line.is_empty() {
            // End of the header block.
            break;
        }
        if let Some(value) = line.strip_prefix("Name:") {
            raw_name = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("Version:") {
            version = Some(value.trim().to_string());
        }
        if raw_name.is_some() && version.is_some() {
            break;
        }
    }
    let (Some(raw_name), Some(version_str)) = (raw_name, version) else {
        return Ok(None);
    };
    let Ok(version) = Version::from_str(&version_str) else {
        return Ok(None);
    };
    Ok(Some(InstalledDist {
        name: CanonicalName::new(&raw_name),
        raw_name,
        version,
        dist_info: dist_info.to_path_buf(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_dist(root: &Path, name: &str, version: &str) -> PathBuf {
        let dist_info = root.join(format!("{name}-{version}.dist-info"));
        fs::create_dir_all(&dist_info).unwrap();
        fs::write(
            dist_info.join("METADATA"),
            format!("Metadata-Version: 2.1\nName: {name}\nVersion: {version}\n"),
        )
        .unwrap();
        dist_info
    }

    #[test]
    fn scans_dist_info_directories() {
        let temp = tempfile::tempdir().unwrap();
        write_dist(temp.path(), "flask", "2.0.1");
        write_dist(temp.path(), "Werkzeug", "2.0.3");
        let map = package_map(temp.path()).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(
            map[&CanonicalName::new("werkzeug")].to_string(),
            "2.0.3".to_string()
        );
    }

    #[test]
    fn record_paths_skips_escapes() {
        let temp = tempfile::tempdir().unwrap();
        let dist_info = write_dist(temp.path(), "flask", "2.0.1");
        fs::write(
            dist_info.join("RECORD"),
            "flask/__init__.py,sha256=abc,120\n../outside.py,,\n",
        )
        .unwrap();
        let dists = scan_distributions(temp.path()).unwrap();
        let paths = dists[0].record_paths().unwrap();
        assert_eq!(paths, vec!["flask/__init__.py".to_string()]);
    }

    #[test]
    fn top_level_falls_back_to_package_name() {
        let temp = tempfile::tempdir().unwrap();
        write_dist(temp.path(), "typing-extensions", "4.9.0");
        let dists = scan_distributions(temp.path()).unwrap();
        assert_eq!(dists[0].top_level().unwrap(), vec!["typing_extensions"]);
    }

    #[test]
    fn ignores_broken_metadata() {
        let temp = tempfile::tempdir().unwrap();
        let dist_info = temp.path().join("broken-1.0.dist-info");
        fs::create_dir_all(&dist_info).unwrap();
        fs::write(dist_info.join("METADATA"), "Name-only garbage\n").unwrap();
        assert!(scan_distributions(temp.path()).unwrap().is_empty());
    }
}
