//! Runtime loader protocol: scoped activation of a bubble over the main
//! environment. The runtime models the interpreter's name-resolution state
//! (search path, loaded-module cache, environment overrides) as typed data;
//! activation pushes a frame, deactivation restores it, strictly LIFO, on
//! every exit path.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use regex::Regex;
use tracing::{debug, warn};
use vx_domain::{BubbleManifest, PackageSpec};

use crate::core::bubble::{bubble_dir, MANIFEST_FILE};
use crate::core::config::settings::InterpreterSettings;

/// Packages the engine itself depends on; never purged by activation.
const PROTECTED_MODULES: &[&str] = &["pip", "setuptools", "wheel", "pkg_resources"];

#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("[VX110] no bubble exists for {spec}")]
    BubbleNotFound { spec: String },
    #[error("[VX401] bubble {label} is corrupted: {reason}")]
    Corrupted { label: String, reason: String },
}

/// The modeled interpreter state an activation manipulates.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuntimeState {
    pub search_path: Vec<PathBuf>,
    pub loaded_modules: BTreeSet<String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug)]
struct Frame {
    id: u64,
    label: String,
    saved: RuntimeState,
    /// Top-level names the bubble owns (provided modules + differing deps).
    namespaces: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct LoaderInner {
    state: RuntimeState,
    frames: Vec<Frame>,
    initialized: bool,
    next_frame_id: u64,
}

/// Process-wide activation stack. Transitions serialize on an internal
/// mutex so concurrent observers see only pre- or post-activation states.
#[derive(Debug, Default)]
pub struct LoaderRuntime {
    inner: Mutex<LoaderInner>,
}

/// What an activation did, for reporting.
#[derive(Clone, Copy, Debug, Default)]
pub struct ActivationReport {
    pub purged_modules: usize,
    pub linked_dependencies: usize,
}

/// Scoped activation. Dropping the guard deactivates, including on panic
/// paths.
#[derive(Debug)]
pub struct ActivationGuard<'rt> {
    runtime: &'rt LoaderRuntime,
    frame_id: u64,
    report: ActivationReport,
}

impl ActivationGuard<'_> {
    pub fn report(&self) -> ActivationReport {
        self.report
    }
}

impl Drop for ActivationGuard<'_> {
    fn drop(&mut self) {
        self.runtime.deactivate(self.frame_id);
    }
}

impl LoaderRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RuntimeState {
        self.inner.lock().expect("loader poisoned").state.clone()
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().expect("loader poisoned").frames.len()
    }

    /// Record a module load observed while scopes are active, so
    /// deactivation can purge loads that resolved against bubble paths.
    pub fn note_module_loaded(&self, module: &str) {
        let mut inner = self.inner.lock().expect("loader poisoned");
        inner.loaded_insert(module);
    }

    /// Activate `spec`'s bubble. Fails with `BubbleNotFound` before any
    /// state change when the bubble or its manifest is absent.
    pub fn activate<'rt>(
        &'rt self,
        settings: &InterpreterSettings,
        spec: &PackageSpec,
    ) -> Result<ActivationGuard<'rt>, LoaderError> {
        let dir = bubble_dir(&settings.bubble_root, spec);
        let manifest_path = dir.join(MANIFEST_FILE);
        if !manifest_path.exists() {
            return Err(LoaderError::BubbleNotFound {
                spec: spec.to_string(),
            });
        }
        let raw = fs::read_to_string(&manifest_path).map_err(|err| LoaderError::Corrupted {
            label: spec.bubble_label(),
            reason: err.to_string(),
        })?;
        let manifest = BubbleManifest::parse(&raw).map_err(|err| LoaderError::Corrupted {
            label: spec.bubble_label(),
            reason: err.to_string(),
        })?;

        let main_packages = vx_domain::package_map(&settings.install_root).unwrap_or_default();

        let mut inner = self.inner.lock().expect("loader poisoned");
        if !inner.initialized {
            inner.state.search_path = vec![settings.install_root.clone()]
                .into_iter()
                .filter(|path| path_is_version_compatible(path, &settings.interpreter))
                .collect();
            inner.initialized = true;
        }

        let saved = inner.state.clone();

        // Namespaces this bubble owns: its provided modules plus any
        // dependency whose pinned version differs from the active one.
        let mut namespaces: BTreeSet<String> =
            manifest.provided_modules.iter().cloned().collect();
        let mut linked = 0usize;
        for (dep, pinned) in &manifest.dependency_snapshot {
            let dep_name = vx_domain::CanonicalName::new(dep);
            match main_packages.get(&dep_name) {
                Some(active) if active.to_string() == *pinned => {
                    // Compatible: resolved from the main environment copy.
                    linked += 1;
                }
                _ => {
                    namespaces.insert(dep_name.filesystem_name());
                }
            }
        }

        // Purge the module cache of everything the bubble shadows.
        let mut purged = 0usize;
        inner.state.loaded_modules.retain(|module| {
            let top = top_level_of(module);
            let owned = namespaces.contains(top) && !PROTECTED_MODULES.contains(&top);
            if owned {
                purged += 1;
            }
            !owned
        });

        // Bubble root shadows everything; compatible dependencies resolve
        // through the main environment entry that stays on the path.
        if path_is_version_compatible(&dir, &settings.interpreter) {
            inner.state.search_path.insert(0, dir.clone());
        }
        if linked > 0 && !inner.state.search_path.contains(&settings.install_root) {
            inner.state.search_path.push(settings.install_root.clone());
        }

        let bin_dir = dir.join("bin");
        if bin_dir.is_dir() {
            let previous = inner.state.env.get("PATH").cloned().unwrap_or_default();
            inner.state.env.insert(
                "PATH".to_string(),
                join_path_var(&bin_dir, &previous),
            );
        }
        let lib_dir = dir.join("lib");
        if lib_dir.is_dir() {
            let previous = inner
                .state
                .env
                .get("LD_LIBRARY_PATH")
                .cloned()
                .unwrap_or_default();
            inner.state.env.insert(
                "LD_LIBRARY_PATH".to_string(),
                join_path_var(&lib_dir, &previous),
            );
        }
        inner.state.env.insert(
            crate::core::interpreters::ENV_ACTIVE_BUBBLE.to_string(),
            spec.to_string(),
        );

        inner.next_frame_id += 1;
        let frame_id = inner.next_frame_id;
        inner.frames.push(Frame {
            id: frame_id,
            label: spec.bubble_label(),
            saved,
            namespaces,
        });
        debug!(label = %spec.bubble_label(), purged, linked, depth = inner.frames.len(), "activated bubble");

        Ok(ActivationGuard {
            runtime: self,
            frame_id,
            report: ActivationReport {
                purged_modules: purged,
                linked_dependencies: linked,
            },
        })
    }

    fn deactivate(&self, frame_id: u64) {
        let mut inner = self.inner.lock().expect("loader poisoned");
        let Some(position) = inner.frames.iter().position(|frame| frame.id == frame_id) else {
            // Already unwound by an out-of-order outer deactivation.
            return;
        };
        if position + 1 != inner.frames.len() {
            warn!(
                label = %inner.frames[position].label,
                "out-of-order deactivation; unwinding inner scopes"
            );
        }
        // LIFO: everything above (and including) the frame unwinds to the
        // frame's captured state.
        let frame = inner.frames.drain(position..).next().expect("frame exists");

        // Modules loaded while the frame was active and owned by the
        // bubble's namespaces are purged; unrelated loads survive (their
        // definitions never resolved through bubble paths).
        let survivors: BTreeSet<String> = inner
            .state
            .loaded_modules
            .iter()
            .filter(|module| {
                !frame.saved.loaded_modules.contains(*module)
                    && !frame.namespaces.contains(top_level_of(module))
            })
            .cloned()
            .collect();

        inner.state = frame.saved;
        for module in survivors {
            inner.loaded_insert(&module);
        }
        debug!(label = %frame.label, depth = inner.frames.len(), "deactivated bubble");
    }
}

impl LoaderInner {
    fn loaded_insert(&mut self, module: &str) {
        self.state.loaded_modules.insert(module.to_string());
    }
}

fn top_level_of(module: &str) -> &str {
    module.split('.').next().unwrap_or(module)
}

fn join_path_var(head: &Path, rest: &str) -> String {
    if rest.is_empty() {
        head.display().to_string()
    } else {
        format!("{}{}{}", head.display(), path_sep(), rest)
    }
}

fn path_sep() -> char {
    if cfg!(windows) {
        ';'
    } else {
        ':'
    }
}

/// Reject search-path entries that belong to a different interpreter
/// version (a `pythonX.Y` component that does not match).
pub(crate) fn path_is_version_compatible(path: &Path, interpreter: &str) -> bool {
    static VERSION_RE: OnceLock<Regex> = OnceLock::new();
    let re = VERSION_RE.get_or_init(|| Regex::new(r"python(\d+\.\d+)").expect("static regex"));
    let text = path.display().to_string().to_lowercase();
    match re.captures(&text) {
        Some(caps) => caps.get(1).is_some_and(|m| m.as_str() == interpreter),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bubble::DEPS_FILE;
    use std::str::FromStr;

    fn settings(temp: &Path) -> InterpreterSettings {
        let mut settings = InterpreterSettings::defaults("3.11", &temp.join("site"));
        settings.bubble_root = temp.join("bubbles");
        settings.state_root = temp.join("state");
        fs::create_dir_all(&settings.install_root).unwrap();
        fs::create_dir_all(&settings.bubble_root).unwrap();
        settings
    }

    fn plant_bubble(settings: &InterpreterSettings, spec: &str, deps: &[(&str, &str)]) {
        let spec = PackageSpec::from_str(spec).unwrap();
        let dir = bubble_dir(&settings.bubble_root, &spec);
        fs::create_dir_all(&dir).unwrap();
        let mut manifest = BubbleManifest::new(
            spec.name.as_str(),
            &spec.version.to_string(),
            "2026-01-01T00:00:00Z".into(),
        );
        manifest.provided_modules.push(spec.name.filesystem_name());
        for (dep, version) in deps {
            manifest
                .dependency_snapshot
                .insert((*dep).to_string(), (*version).to_string());
        }
        manifest.normalize();
        fs::write(dir.join(MANIFEST_FILE), manifest.render().unwrap()).unwrap();
        fs::write(
            dir.join(DEPS_FILE),
            serde_json::to_string_pretty(&manifest.dependency_snapshot).unwrap(),
        )
        .unwrap();
    }

    fn write_dist(root: &Path, name: &str, version: &str) {
        let dist_info = root.join(format!("{name}-{version}.dist-info"));
        fs::create_dir_all(&dist_info).unwrap();
        fs::write(
            dist_info.join("METADATA"),
            format!("Metadata-Version: 2.1\nName: {name}\nVersion: {version}\n"),
        )
        .unwrap();
    }

    #[test]
    fn missing_bubble_leaves_state_untouched() {
        let temp = tempfile::tempdir().unwrap();
        let settings = settings(temp.path());
        let runtime = LoaderRuntime::new();
        let before = runtime.state();
        let err = runtime
            .activate(&settings, &PackageSpec::from_str("ghost==1.0").unwrap())
            .unwrap_err();
        assert!(matches!(err, LoaderError::BubbleNotFound { .. }));
        assert_eq!(runtime.state(), before);
    }

    #[test]
    fn activation_restores_state_byte_for_byte() {
        let temp = tempfile::tempdir().unwrap();
        let settings = settings(temp.path());
        plant_bubble(&settings, "rich==10.0.0", &[]);

        let runtime = LoaderRuntime::new();
        runtime.note_module_loaded("rich");
        runtime.note_module_loaded("unrelated");
        let before = runtime.state();

        {
            let guard = runtime
                .activate(&settings, &PackageSpec::from_str("rich==10.0.0").unwrap())
                .unwrap();
            assert_eq!(guard.report().purged_modules, 1);
            let active = runtime.state();
            assert_eq!(
                active.search_path[0],
                bubble_dir(&settings.bubble_root, &PackageSpec::from_str("rich==10.0.0").unwrap())
            );
            assert!(!active.loaded_modules.contains("rich"));
            assert!(active.loaded_modules.contains("unrelated"));
            assert_eq!(
                active.env.get(crate::core::interpreters::ENV_ACTIVE_BUBBLE),
                Some(&"rich==10.0.0".to_string())
            );
        }
        // Note: baseline initialization happens on first activation.
        let mut expected = before;
        expected.search_path = vec![settings.install_root.clone()];
        assert_eq!(runtime.state(), expected);
    }

    #[test]
    fn nested_activation_is_lifo() {
        let temp = tempfile::tempdir().unwrap();
        let settings = settings(temp.path());
        plant_bubble(&settings, "t==4.5.0", &[]);
        plant_bubble(&settings, "u==2.13.0", &[]);

        let runtime = LoaderRuntime::new();
        let outer_spec = PackageSpec::from_str("t==4.5.0").unwrap();
        let inner_spec = PackageSpec::from_str("u==2.13.0").unwrap();
        let outer_dir = bubble_dir(&settings.bubble_root, &outer_spec);
        let inner_dir = bubble_dir(&settings.bubble_root, &inner_spec);

        let _outer = runtime.activate(&settings, &outer_spec).unwrap();
        let after_outer = runtime.state();
        {
            let _inner = runtime.activate(&settings, &inner_spec).unwrap();
            let state = runtime.state();
            // Both bubbles resolvable inside the inner scope.
            assert_eq!(state.search_path[0], inner_dir);
            assert!(state.search_path.contains(&outer_dir));
        }
        // Inner exit: outer still active, inner gone.
        let state = runtime.state();
        assert_eq!(state, after_outer);
        assert!(!state.search_path.contains(&inner_dir));
        assert!(state.search_path.contains(&outer_dir));
    }

    #[test]
    fn modules_loaded_in_scope_are_purged_on_exit() {
        let temp = tempfile::tempdir().unwrap();
        let settings = settings(temp.path());
        plant_bubble(&settings, "rich==10.0.0", &[]);

        let runtime = LoaderRuntime::new();
        {
            let _guard = runtime
                .activate(&settings, &PackageSpec::from_str("rich==10.0.0").unwrap())
                .unwrap();
            runtime.note_module_loaded("rich.console");
            runtime.note_module_loaded("bystander");
        }
        let state = runtime.state();
        assert!(!state.loaded_modules.contains("rich.console"));
        assert!(state.loaded_modules.contains("bystander"));
    }

    #[test]
    fn compatible_dependencies_are_linked_not_shadowed() {
        let temp = tempfile::tempdir().unwrap();
        let settings = settings(temp.path());
        write_dist(&settings.install_root, "werkzeug", "2.0.3");
        plant_bubble(
            &settings,
            "flask==2.0.1",
            &[("werkzeug", "2.0.3"), ("jinja2", "3.0.0")],
        );

        let runtime = LoaderRuntime::new();
        let guard = runtime
            .activate(&settings, &PackageSpec::from_str("flask==2.0.1").unwrap())
            .unwrap();
        // werkzeug matches the active version: linked. jinja2 differs:
        // owned by the bubble namespace instead.
        assert_eq!(guard.report().linked_dependencies, 1);
    }

    #[test]
    fn protected_modules_survive_activation() {
        let temp = tempfile::tempdir().unwrap();
        let settings = settings(temp.path());
        plant_bubble(&settings, "pip==21.0.0", &[]);

        let runtime = LoaderRuntime::new();
        runtime.note_module_loaded("pip");
        let guard = runtime
            .activate(&settings, &PackageSpec::from_str("pip==21.0.0").unwrap())
            .unwrap();
        assert_eq!(guard.report().purged_modules, 0);
        assert!(runtime.state().loaded_modules.contains("pip"));
    }

    #[test]
    fn incompatible_interpreter_paths_are_rejected() {
        assert!(path_is_version_compatible(
            Path::new("/usr/lib/python3.11/site-packages"),
            "3.11"
        ));
        assert!(!path_is_version_compatible(
            Path::new("/usr/lib/python3.9/site-packages"),
            "3.11"
        ));
        assert!(path_is_version_compatible(Path::new("/opt/libs"), "3.11"));
    }
}
