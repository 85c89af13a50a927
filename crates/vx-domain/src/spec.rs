use std::fmt;
use std::str::FromStr;

use pep440_rs::Version;

use crate::name::CanonicalName;

/// An exact `name==version` pin, the unit of work for install and bubble
/// creation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackageSpec {
    pub name: CanonicalName,
    pub raw_name: String,
    pub version: Version,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SpecError {
    #[error("[VX100] invalid package spec '{0}': expected name==version")]
    MissingPin(String),
    #[error("[VX100] invalid package name in '{0}'")]
    BadName(String),
    #[error("[VX100] invalid version '{version}' in '{spec}'")]
    BadVersion { spec: String, version: String },
}

impl PackageSpec {
    pub fn new(name: &str, version: Version) -> Self {
        Self {
            name: CanonicalName::new(name),
            raw_name: name.to_string(),
            version,
        }
    }

    /// Parse `name==version`. Extras and environment markers are rejected;
    /// the engine only ever pins exact versions.
    pub fn parse(raw: &str) -> Result<Self, SpecError> {
        let raw = raw.trim();
        let Some((name_part, version_part)) = raw.split_once("==") else {
            return Err(SpecError::MissingPin(raw.to_string()));
        };
        let name_part = name_part.trim();
        let version_part = version_part.trim();
        if name_part.is_empty()
            || !name_part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(SpecError::BadName(raw.to_string()));
        }
        let version = Version::from_str(version_part).map_err(|_| SpecError::BadVersion {
            spec: raw.to_string(),
            version: version_part.to_string(),
        })?;
        Ok(Self::new(name_part, version))
    }

    /// The `<name>-<version>` label used for bubble directories and KB keys.
    pub fn bubble_label(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }
}

/// Split a loose requirement string (a user-provided target such as
/// `Flask`, `flask==2.0.1`, or `flask[async]==2.0.1`) into a canonical
/// name and an optional exact pin. Full PEP 508 grammar is accepted for
/// validation; only exact pins are honored.
pub fn split_requirement(raw: &str) -> Result<(CanonicalName, Option<Version>), SpecError> {
    let raw = raw.trim();
    let requirement = pep508_rs::Requirement::from_str(raw)
        .map_err(|_| SpecError::BadName(raw.to_string()))?;
    let name = CanonicalName::new(&requirement.name.to_string());
    if let Some((_, version_part)) = raw.split_once("==") {
        let version_part = version_part.trim();
        let version = Version::from_str(version_part).map_err(|_| SpecError::BadVersion {
            spec: raw.to_string(),
            version: version_part.to_string(),
        })?;
        return Ok((name, Some(version)));
    }
    Ok((name, None))
}

impl fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=={}", self.name, self.version)
    }
}

impl FromStr for PackageSpec {
    type Err = SpecError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exact_pin() {
        let spec = PackageSpec::parse("Requests==2.31.0").unwrap();
        assert_eq!(spec.name.as_str(), "requests");
        assert_eq!(spec.version.to_string(), "2.31.0");
        assert_eq!(spec.to_string(), "requests==2.31.0");
    }

    #[test]
    fn rejects_bare_name() {
        assert!(matches!(
            PackageSpec::parse("requests"),
            Err(SpecError::MissingPin(_))
        ));
    }

    #[test]
    fn rejects_garbage_version() {
        assert!(matches!(
            PackageSpec::parse("requests==not.a.version.!"),
            Err(SpecError::BadVersion { .. })
        ));
    }

    #[test]
    fn bubble_label_is_name_dash_version() {
        let spec = PackageSpec::parse("flask==2.0.1").unwrap();
        assert_eq!(spec.bubble_label(), "flask-2.0.1");
    }

    #[test]
    fn split_requirement_handles_loose_targets() {
        let (name, pin) = split_requirement("Flask").unwrap();
        assert_eq!(name.as_str(), "flask");
        assert!(pin.is_none());

        let (name, pin) = split_requirement("flask==2.0.1").unwrap();
        assert_eq!(name.as_str(), "flask");
        assert_eq!(pin.unwrap().to_string(), "2.0.1");

        assert!(split_requirement("===!bogus").is_err());
    }

    #[test]
    fn prerelease_orders_before_final() {
        let pre = PackageSpec::parse("pkg==2.0.0rc1").unwrap();
        let fin = PackageSpec::parse("pkg==2.0.0").unwrap();
        assert!(pre.version < fin.version);
    }
}
