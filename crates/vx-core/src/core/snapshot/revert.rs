//! Revert planning: the symmetric difference between the current package
//! map and a target snapshot, expressed as forward operations. History is
//! never rewritten; executing a plan produces a new state (and a new
//! snapshot), it does not mutate old ones.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use pep440_rs::Version;
use vx_domain::{CanonicalName, EnvSnapshot, PackageSpec};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RevertAction {
    /// Present in the target snapshot but missing now.
    Install(PackageSpec),
    /// Present now but absent from the target snapshot.
    Remove(CanonicalName),
    /// Version drifted; install the target version.
    Fix {
        name: CanonicalName,
        current: Version,
        target: Version,
    },
}

impl RevertAction {
    /// The spec this action needs installed, if any.
    pub fn install_spec(&self) -> Option<PackageSpec> {
        match self {
            Self::Install(spec) => Some(spec.clone()),
            Self::Fix { name, target, .. } => {
                Some(PackageSpec::new(name.as_str(), target.clone()))
            }
            Self::Remove(_) => None,
        }
    }
}

impl fmt::Display for RevertAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Install(spec) => write!(f, "install {spec}"),
            Self::Remove(name) => write!(f, "remove {name}"),
            Self::Fix {
                name,
                current,
                target,
            } => write!(f, "fix {name} {current} -> {target}"),
        }
    }
}

/// Compute the minimal corrective plan, ordered by package name. Reverting
/// to the current state yields an empty plan.
pub fn plan_revert(
    current: &BTreeMap<CanonicalName, Version>,
    target: &EnvSnapshot,
) -> Vec<RevertAction> {
    let mut wanted: BTreeMap<CanonicalName, Version> = BTreeMap::new();
    for (name, version) in &target.packages {
        if let Ok(version) = Version::from_str(version) {
            wanted.insert(CanonicalName::new(name), version);
        }
    }

    let mut plan = Vec::new();
    for (name, target_version) in &wanted {
        match current.get(name) {
            None => plan.push(RevertAction::Install(PackageSpec::new(
                name.as_str(),
                target_version.clone(),
            ))),
            Some(current_version) if current_version != target_version => {
                plan.push(RevertAction::Fix {
                    name: name.clone(),
                    current: current_version.clone(),
                    target: target_version.clone(),
                });
            }
            Some(_) => {}
        }
    }
    for name in current.keys() {
        if !wanted.contains_key(name) {
            plan.push(RevertAction::Remove(name.clone()));
        }
    }
    plan.sort_by_key(|action| match action {
        RevertAction::Install(spec) => spec.name.clone(),
        RevertAction::Remove(name) => name.clone(),
        RevertAction::Fix { name, .. } => name.clone(),
    });
    plan
}
