//! Reorder-and-diff: sort each package's requested versions newest-first so
//! every later install of an older version is unambiguously a downgrade,
//! the trigger condition for bubble creation.

use std::collections::BTreeMap;

use vx_domain::{CanonicalName, PackageSpec};

pub fn version_reorder(specs: &[PackageSpec]) -> Vec<PackageSpec> {
    let mut order: Vec<CanonicalName> = Vec::new();
    let mut groups: BTreeMap<CanonicalName, Vec<PackageSpec>> = BTreeMap::new();
    for spec in specs {
        if !groups.contains_key(&spec.name) {
            order.push(spec.name.clone());
        }
        groups.entry(spec.name.clone()).or_default().push(spec.clone());
    }
    let mut result = Vec::with_capacity(specs.len());
    for name in order {
        let mut group = groups.remove(&name).unwrap_or_default();
        group.sort_by(|a, b| b.version.cmp(&a.version));
        result.extend(group);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs(raw: &[&str]) -> Vec<PackageSpec> {
        raw.iter().map(|s| PackageSpec::parse(s).unwrap()).collect()
    }

    fn rendered(specs: &[PackageSpec]) -> Vec<String> {
        specs.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn newest_first_within_group_groups_in_original_order() {
        let input = specs(&["a==1.0", "a==2.0", "b==3.0"]);
        let result = version_reorder(&input);
        assert_eq!(rendered(&result), vec!["a==2.0", "a==1.0", "b==3.0"]);
    }

    #[test]
    fn scenario_single_package_conflict() {
        let input = specs(&["x==1.0.0", "x==2.0.0"]);
        let result = version_reorder(&input);
        assert_eq!(rendered(&result), vec!["x==2.0.0", "x==1.0.0"]);
    }

    #[test]
    fn prerelease_sorts_after_final() {
        let input = specs(&["pkg==2.0.0rc1", "pkg==2.0.0", "pkg==1.9.0"]);
        let result = version_reorder(&input);
        assert_eq!(
            rendered(&result),
            vec!["pkg==2.0.0", "pkg==2.0.0rc1", "pkg==1.9.0"]
        );
    }

    #[test]
    fn untouched_when_already_ordered() {
        let input = specs(&["a==2.0", "b==1.0"]);
        assert_eq!(version_reorder(&input), input);
    }
}
