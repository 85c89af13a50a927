use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Reserved snapshot id rewritten after every successful mutation, used by
/// `revert` when no explicit target is given.
pub const LAST_GOOD_SNAPSHOT_ID: &str = "last-good";

/// Immutable record of the main environment's package map at a point in
/// time. Snapshots are append-only; revert never rewrites one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvSnapshot {
    pub id: String,
    pub interpreter_version: String,
    pub captured_at: String,
    /// Canonical name → version string for every visible package.
    pub packages: BTreeMap<String, String>,
    /// sha256 of the installer's dependency-lock file, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_digest: Option<String>,
}

impl EnvSnapshot {
    pub fn new(id: String, interpreter_version: String, captured_at: String) -> Self {
        Self {
            id,
            interpreter_version,
            captured_at,
            packages: BTreeMap::new(),
            lock_digest: None,
        }
    }

    pub fn render(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn parse(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_preserves_package_map() {
        let mut snapshot = EnvSnapshot::new(
            "st-20260101T000000-0001".into(),
            "3.11".into(),
            "2026-01-01T00:00:00Z".into(),
        );
        snapshot.packages.insert("flask".into(), "2.0.1".into());
        snapshot.packages.insert("werkzeug".into(), "2.0.3".into());
        let rendered = snapshot.render().unwrap();
        let reparsed = EnvSnapshot::parse(&rendered).unwrap();
        assert_eq!(reparsed, snapshot);
        assert_eq!(reparsed.render().unwrap(), rendered);
    }
}
