//! The KB key space. Keys are hierarchical, colon-separated, and every
//! multi-key mutation names its full group up front so the optimistic
//! commit can detect racing writers.

pub const SCHEMA_KEY: &str = "schema:version";
pub const SCHEMA_VERSION: u32 = 1;

pub const PKG_PREFIX: &str = "pkg:";
pub const BUBBLE_PREFIX: &str = "bubble:";
pub const SNAPSHOT_PREFIX: &str = "snapshot:";
pub const INTERPRETER_PREFIX: &str = "interpreter:";

pub fn pkg_versions(name: &str) -> String {
    format!("pkg:{name}:versions")
}

pub fn pkg_active(name: &str) -> String {
    format!("pkg:{name}:active")
}

pub fn pkg_meta(name: &str, version: &str) -> String {
    format!("pkg:{name}:{version}:meta")
}

pub fn pkg_failed(name: &str, version: &str) -> String {
    format!("pkg:{name}:{version}:failed")
}

pub fn bubble(name: &str, version: &str) -> String {
    format!("bubble:{name}:{version}")
}

pub fn bubble_build(name: &str, version: &str) -> String {
    format!("bubble:{name}:{version}:build")
}

pub fn snapshot(id: &str) -> String {
    format!("snapshot:{id}")
}

pub fn interpreter(version: &str) -> String {
    format!("interpreter:{version}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_prefix_scannable() {
        assert!(pkg_versions("flask").starts_with(PKG_PREFIX));
        assert!(bubble("flask", "2.0.1").starts_with(BUBBLE_PREFIX));
        assert!(bubble_build("flask", "2.0.1").starts_with(&bubble("flask", "2.0.1")));
        assert!(snapshot("last-good").starts_with(SNAPSHOT_PREFIX));
    }
}
