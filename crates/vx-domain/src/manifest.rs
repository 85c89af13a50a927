use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const MANIFEST_FORMAT_VERSION: u32 = 1;

/// How a bubble entry is backed on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Self-contained bytes copied into the bubble.
    File,
    /// Symbolic link into the main environment.
    Symlink,
    /// Shared bytes (hard link or activation-time reference) whose hash
    /// matches the main-environment file at the same relative path.
    DedupRef,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub relative_path: String,
    pub kind: EntryKind,
    pub sha256: String,
    pub size: u64,
}

/// Per-bubble file inventory. Entries are kept sorted by relative path so
/// serialization is canonical: serialize → deserialize → re-serialize is
/// byte-identical.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BubbleManifest {
    pub format_version: u32,
    pub package: String,
    pub version: String,
    pub created_at: String,
    pub provided_modules: Vec<String>,
    pub dependency_snapshot: BTreeMap<String, String>,
    pub entries: Vec<ManifestEntry>,
}

impl BubbleManifest {
    pub fn new(package: &str, version: &str, created_at: String) -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            package: package.to_string(),
            version: version.to_string(),
            created_at,
            provided_modules: Vec::new(),
            dependency_snapshot: BTreeMap::new(),
            entries: Vec::new(),
        }
    }

    pub fn push_entry(&mut self, entry: ManifestEntry) {
        self.entries.push(entry);
    }

    /// Sort entries and modules into canonical order. Must be called before
    /// rendering.
    pub fn normalize(&mut self) {
        self.entries
            .sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        self.provided_modules.sort();
        self.provided_modules.dedup();
    }

    pub fn render(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn parse(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    pub fn deduped_bytes(&self) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.kind != EntryKind::File)
            .map(|e| e.size)
            .sum()
    }
}
