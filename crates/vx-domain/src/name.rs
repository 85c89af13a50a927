use std::fmt;

use serde::{Deserialize, Serialize};

/// Canonical (normalized) package name.
///
/// Names are lowercased and runs of `-`, `_` and `.` collapse into a single
/// `-`, so `Foo_Bar` and `foo.bar` address the same package.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalName(String);

impl CanonicalName {
    pub fn new(raw: &str) -> Self {
        let mut out = String::with_capacity(raw.len());
        let mut last_sep = false;
        for ch in raw.trim().chars() {
            if matches!(ch, '-' | '_' | '.') {
                if !last_sep && !out.is_empty() {
                    out.push('-');
                }
                last_sep = true;
            } else {
                out.push(ch.to_ascii_lowercase());
                last_sep = false;
            }
        }
        if out.ends_with('-') {
            out.pop();
        }
        Self(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The name as it appears on the filesystem (`-` becomes `_`), matching
    /// how distributions lay out module directories and dist-info dirs.
    pub fn filesystem_name(&self) -> String {
        self.0.replace('-', "_")
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CanonicalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CanonicalName {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_separators() {
        assert_eq!(CanonicalName::new("Foo_Bar").as_str(), "foo-bar");
        assert_eq!(CanonicalName::new("foo.bar").as_str(), "foo-bar");
        assert_eq!(CanonicalName::new("foo--bar__baz").as_str(), "foo-bar-baz");
        assert_eq!(CanonicalName::new("Requests").as_str(), "requests");
    }

    #[test]
    fn filesystem_name_uses_underscores() {
        assert_eq!(
            CanonicalName::new("typing-extensions").filesystem_name(),
            "typing_extensions"
        );
    }

    #[test]
    fn equal_after_normalization() {
        assert_eq!(CanonicalName::new("A.B-C"), CanonicalName::new("a_b_c"));
    }
}
