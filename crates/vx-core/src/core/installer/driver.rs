use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use pep440_rs::Version;
use tracing::{debug, warn};
use vx_domain::{package_map, scan_distributions, CanonicalName, PackageSpec};

use super::report::{parse_install_report, InstallReport};
use super::InstallerError;
use crate::core::interpreters::ENV_SUBPROCESS;
use crate::core::process;

const STDERR_TAIL_LINES: usize = 20;

/// One tool from the configured priority list, resolved to an executable.
#[derive(Clone, Debug)]
pub struct InstallerTool {
    pub name: String,
    pub program: PathBuf,
}

/// Cheap satisfiability check against current environment metadata.
#[derive(Debug, PartialEq, Eq)]
pub enum Preflight {
    Satisfied,
    NeedsWork(Vec<PackageSpec>),
}

/// Classification of every package the staging run changed, measured
/// against a reference package map.
#[derive(Debug, Default, Clone)]
pub struct StagedDelta {
    pub added: Vec<(CanonicalName, Version)>,
    pub upgraded: Vec<(CanonicalName, Version, Version)>,
    pub downgraded: Vec<(CanonicalName, Version, Version)>,
    pub removed: Vec<(CanonicalName, Version)>,
}

#[derive(Debug)]
pub struct StagedResult {
    pub target_root: PathBuf,
    pub installed: BTreeMap<CanonicalName, Version>,
    pub delta: StagedDelta,
    pub report: Option<InstallReport>,
}

#[derive(Debug)]
pub struct InstallerDriver {
    tool: InstallerTool,
    python: PathBuf,
    timeout: Duration,
}

impl InstallerDriver {
    /// Resolve the first tool from the priority list present on PATH.
    pub fn select(
        priority: &[String],
        python: &Path,
        timeout: Duration,
    ) -> Result<Self, InstallerError> {
        for name in priority {
            if name == "pip" {
                // pip runs through the target interpreter, so the
                // interpreter itself is the program.
                return Ok(Self::with_tool(
                    InstallerTool {
                        name: name.clone(),
                        program: python.to_path_buf(),
                    },
                    python,
                    timeout,
                ));
            }
            if let Ok(program) = which::which(name) {
                return Ok(Self::with_tool(
                    InstallerTool {
                        name: name.clone(),
                        program,
                    },
                    python,
                    timeout,
                ));
            }
        }
        Err(InstallerError::NoInstaller {
            tried: priority.to_vec(),
        })
    }

    pub fn with_tool(tool: InstallerTool, python: &Path, timeout: Duration) -> Self {
        Self {
            tool,
            python: python.to_path_buf(),
            timeout,
        }
    }

    pub fn tool_name(&self) -> &str {
        &self.tool.name
    }

    /// Sub-second check: every spec already active in `installed` means
    /// `Satisfied`; otherwise the unmet subset is returned.
    pub fn preflight(
        &self,
        specs: &[PackageSpec],
        installed: &BTreeMap<CanonicalName, Version>,
    ) -> Preflight {
        let unmet: Vec<PackageSpec> = specs
            .iter()
            .filter(|spec| installed.get(&spec.name) != Some(&spec.version))
            .cloned()
            .collect();
        if unmet.is_empty() {
            Preflight::Satisfied
        } else {
            Preflight::NeedsWork(unmet)
        }
    }

    /// Drive the installer into `target_root`, isolated from the main
    /// environment, and classify the result against `reference` (the main
    /// environment's package map for bubble staging, or the pre-install
    /// map for in-place installs).
    pub fn stage(
        &self,
        specs: &[PackageSpec],
        target_root: &Path,
        reference: &BTreeMap<CanonicalName, Version>,
        phase: &str,
    ) -> Result<StagedResult, InstallerError> {
        let spec_args: Vec<String> = specs.iter().map(ToString::to_string).collect();
        self.stage_args(&spec_args, target_root, reference, phase)
    }

    /// Like [`Self::stage`] but with raw requirement strings, used when a
    /// healing plan has no pinned version and the installer resolves one.
    pub fn stage_args(
        &self,
        spec_args: &[String],
        target_root: &Path,
        reference: &BTreeMap<CanonicalName, Version>,
        phase: &str,
    ) -> Result<StagedResult, InstallerError> {
        fs::create_dir_all(target_root)
            .with_context(|| format!("failed to create {}", target_root.display()))
            .map_err(InstallerError::Io)?;

        let report_path = target_root.join(".vx-install-report.json");
        let (program, args, expects_report) =
            self.install_command(spec_args, target_root, &report_path);
        debug!(tool = %self.tool.name, phase, ?args, "invoking installer");

        let output = process::run_command_with_timeout(
            &program,
            &args,
            &[(ENV_SUBPROCESS.to_string(), "1".to_string())],
            target_root,
            self.timeout,
        )
        .map_err(InstallerError::Io)?;

        if output.timed_out {
            return Err(InstallerError::Timeout {
                phase: phase.to_string(),
                seconds: self.timeout.as_secs(),
            });
        }
        if output.code != 0 {
            let tail = output.stderr_tail(STDERR_TAIL_LINES);
            if tail.trim().is_empty() && output.stdout.trim().is_empty() {
                return Err(InstallerError::Protocol(format!(
                    "installer exited {} with no diagnostics",
                    output.code
                )));
            }
            return Err(InstallerError::InstallFailed {
                phase: phase.to_string(),
                stderr_tail: if tail.trim().is_empty() {
                    output.stdout.trim().to_string()
                } else {
                    tail
                },
            });
        }

        let report = if expects_report {
            let raw = fs::read_to_string(&report_path).map_err(|err| {
                InstallerError::Protocol(format!("installer wrote no report: {err}"))
            })?;
            let parsed = parse_install_report(&raw)?;
            fs::remove_file(&report_path).ok();
            Some(parsed)
        } else {
            None
        };

        let installed = package_map(target_root)
            .context("failed to scan staged root")
            .map_err(InstallerError::Io)?;
        let delta = classify_delta(reference, &installed);
        Ok(StagedResult {
            target_root: target_root.to_path_buf(),
            installed,
            delta,
            report,
        })
    }

    /// Remove distributions from `root` by their RECORD inventories. The
    /// engine owns layout mutations inside roots it manages, so this stays
    /// a filesystem operation instead of an installer subprocess.
    pub fn uninstall(
        &self,
        names: &[CanonicalName],
        root: &Path,
    ) -> Result<Vec<CanonicalName>, InstallerError> {
        let dists = scan_distributions(root)
            .context("failed to scan environment")
            .map_err(InstallerError::Io)?;
        let mut removed = Vec::new();
        for dist in dists {
            if !names.contains(&dist.name) {
                continue;
            }
            let paths = dist
                .record_paths()
                .context("failed to read RECORD")
                .map_err(InstallerError::Io)?;
            for rel in &paths {
                let path = root.join(rel);
                if path.is_file() || path.is_symlink() {
                    fs::remove_file(&path).ok();
                }
            }
            for module in dist.top_level().unwrap_or_default() {
                let dir = root.join(&module);
                if dir.is_dir() {
                    fs::remove_dir_all(&dir).ok();
                }
            }
            if dist.dist_info.exists() {
                fs::remove_dir_all(&dist.dist_info)
                    .with_context(|| format!("failed to remove {}", dist.dist_info.display()))
                    .map_err(InstallerError::Io)?;
            }
            removed.push(dist.name);
        }
        prune_empty_dirs(root);
        Ok(removed)
    }

    fn install_command(
        &self,
        spec_args: &[String],
        target_root: &Path,
        report_path: &Path,
    ) -> (PathBuf, Vec<String>, bool) {
        let spec_args = spec_args.iter().cloned();
        match self.tool.name.as_str() {
            "pip" => {
                let mut args = vec![
                    "-m".to_string(),
                    "pip".to_string(),
                    "install".to_string(),
                    "--quiet".to_string(),
                    "--no-input".to_string(),
                    "--target".to_string(),
                    target_root.display().to_string(),
                    "--report".to_string(),
                    report_path.display().to_string(),
                ];
                args.extend(spec_args);
                (self.tool.program.clone(), args, true)
            }
            "uv" => {
                let mut args = vec![
                    "pip".to_string(),
                    "install".to_string(),
                    "--quiet".to_string(),
                    "--python".to_string(),
                    self.python.display().to_string(),
                    "--target".to_string(),
                    target_root.display().to_string(),
                ];
                args.extend(spec_args);
                (self.tool.program.clone(), args, false)
            }
            other => {
                // Generic contract for auxiliary tools: they accept
                // `install --target <dir> --report <file> <specs...>` and
                // write a pip-format install report.
                let _ = other;
                let mut args = vec![
                    "install".to_string(),
                    "--target".to_string(),
                    target_root.display().to_string(),
                    "--report".to_string(),
                    report_path.display().to_string(),
                ];
                args.extend(spec_args);
                (self.tool.program.clone(), args, true)
            }
        }
    }
}

fn classify_delta(
    reference: &BTreeMap<CanonicalName, Version>,
    current: &BTreeMap<CanonicalName, Version>,
) -> StagedDelta {
    let mut delta = StagedDelta::default();
    for (name, version) in current {
        match reference.get(name) {
            None => delta.added.push((name.clone(), version.clone())),
            Some(previous) if previous < version => {
                delta
                    .upgraded
                    .push((name.clone(), previous.clone(), version.clone()));
            }
            Some(previous) if previous > version => {
                delta
                    .downgraded
                    .push((name.clone(), previous.clone(), version.clone()));
            }
            Some(_) => {}
        }
    }
    for (name, version) in reference {
        if !current.contains_key(name) {
            delta.removed.push((name.clone(), version.clone()));
        }
    }
    delta
}

fn prune_empty_dirs(root: &Path) {
    let Ok(entries) = fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() && fs::read_dir(&path).map(|mut d| d.next().is_none()).unwrap_or(false) {
            if let Err(err) = fs::remove_dir(&path) {
                warn!(path = %path.display(), %err, "failed to prune empty dir");
            }
        }
    }
}
