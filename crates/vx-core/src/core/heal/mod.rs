//! Healing planner: turns an observed failure (stderr) into requirements
//! that, once satisfied by bubbles, let the run succeed. The pattern table
//! is the entire recognized set; anything it misses is not healed.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use vx_domain::CanonicalName;

pub const MAX_HEAL_ATTEMPTS: u32 = 3;

/// One inferred requirement. A missing version means "whatever the
/// installer resolves", used for plain missing modules.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealRequirement {
    pub name: CanonicalName,
    pub version: Option<String>,
}

impl HealRequirement {
    pub fn pinned(name: &str, version: &str) -> Self {
        Self {
            name: CanonicalName::new(name),
            version: Some(version.to_string()),
        }
    }

    pub fn unpinned(name: &str) -> Self {
        Self {
            name: CanonicalName::new(name),
            version: None,
        }
    }
}

/// Transient plan driving the heal loop; never persisted.
#[derive(Clone, Debug, Serialize)]
pub struct HealingPlan {
    pub requirements: Vec<HealRequirement>,
    pub attempt: u32,
    pub max_attempts: u32,
}

impl HealingPlan {
    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn next_attempt(mut self) -> Self {
        self.attempt += 1;
        self
    }
}

#[derive(Clone, Copy, Debug)]
pub struct HealPattern {
    pub name: &'static str,
    pub pattern: &'static str,
}

/// The recognized error shapes, in match priority order.
pub const PATTERNS: &[HealPattern] = &[
    HealPattern {
        name: "version_assertion",
        pattern: r#"assert\s+([A-Za-z0-9_.\-]+)\.__version__\s*==\s*['"]([^'"]+)['"]"#,
    },
    HealPattern {
        name: "expected_spec",
        pattern: r"[Ee]xpected\s+([A-Za-z0-9_.\-]+)==([0-9][\w.!+\-]*)",
    },
    HealPattern {
        name: "pip_requires",
        pattern: r"([A-Za-z0-9_.\-]+)==([0-9][\w.!+\-]*)\s+is required",
    },
    HealPattern {
        name: "version_conflict",
        pattern: r"VersionConflict.*?Requirement\.parse\('([A-Za-z0-9_.\-]+)==([0-9][\w.!+\-]*)'\)",
    },
    HealPattern {
        name: "module_not_found",
        pattern: r"ModuleNotFoundError: No module named '([^'.]+)",
    },
];

fn compiled() -> &'static Vec<(&'static str, Regex)> {
    static COMPILED: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        PATTERNS
            .iter()
            .map(|p| (p.name, Regex::new(p.pattern).expect("static regex")))
            .collect()
    })
}

/// Analyze captured stderr into a healing plan. Returns `None` when no
/// pattern matches; the failure is surfaced unhealed.
pub fn analyze(stderr: &str) -> Option<HealingPlan> {
    let mut requirements: Vec<HealRequirement> = Vec::new();
    for (name, regex) in compiled() {
        for caps in regex.captures_iter(stderr) {
            let requirement = match *name {
                "module_not_found" => HealRequirement::unpinned(&caps[1]),
                _ => HealRequirement::pinned(&caps[1], &caps[2]),
            };
            if !requirements
                .iter()
                .any(|existing| existing.name == requirement.name)
            {
                requirements.push(requirement);
            }
        }
    }
    if requirements.is_empty() {
        return None;
    }
    Some(HealingPlan {
        requirements,
        attempt: 1,
        max_attempts: MAX_HEAL_ATTEMPTS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_assertion_from_traceback() {
        let stderr = r#"Traceback (most recent call last):
  File "check.py", line 3, in <module>
    assert flask.__version__ == '1.1.4'
AssertionError"#;
        let plan = analyze(stderr).unwrap();
        assert_eq!(plan.requirements, vec![HealRequirement::pinned("flask", "1.1.4")]);
        assert_eq!(plan.attempt, 1);
        assert!(!plan.exhausted());
    }

    #[test]
    fn module_not_found_is_unpinned() {
        let stderr = "ModuleNotFoundError: No module named 'rich'";
        let plan = analyze(stderr).unwrap();
        assert_eq!(plan.requirements, vec![HealRequirement::unpinned("rich")]);
    }

    #[test]
    fn submodule_heals_the_top_level_package() {
        let stderr = "ModuleNotFoundError: No module named 'rich.console'";
        let plan = analyze(stderr).unwrap();
        assert_eq!(plan.requirements[0].name.as_str(), "rich");
    }

    #[test]
    fn pip_requires_line() {
        let stderr = "ERROR: some-tool 2.0 needs it: werkzeug==2.0.3 is required";
        let plan = analyze(stderr).unwrap();
        assert_eq!(
            plan.requirements,
            vec![HealRequirement::pinned("werkzeug", "2.0.3")]
        );
    }

    #[test]
    fn version_conflict_requirement_string() {
        let stderr = "pkg_resources.VersionConflict: (rich 13.0.0 (/site)) Requirement.parse('rich==10.0.0')";
        let plan = analyze(stderr).unwrap();
        assert_eq!(
            plan.requirements,
            vec![HealRequirement::pinned("rich", "10.0.0")]
        );
    }

    #[test]
    fn first_match_per_package_wins() {
        let stderr = r#"assert numpy.__version__ == '1.24.0'
ModuleNotFoundError: No module named 'numpy'"#;
        let plan = analyze(stderr).unwrap();
        assert_eq!(plan.requirements.len(), 1);
        assert_eq!(
            plan.requirements[0],
            HealRequirement::pinned("numpy", "1.24.0")
        );
    }

    #[test]
    fn unrecognized_failure_is_not_healed() {
        assert!(analyze("Segmentation fault (core dumped)").is_none());
    }

    #[test]
    fn attempts_cap_at_max() {
        let plan = analyze("ModuleNotFoundError: No module named 'x'").unwrap();
        let plan = plan.next_attempt().next_attempt();
        assert!(plan.exhausted());
    }
}
