//! Interpreter registry: the mapping from interpreter version to
//! executable, with adopt/remove/rescan operations and the environment
//! contract child processes dispatch on.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::core::fsutil;
use crate::core::process;

/// Names the interpreter a shimmed child should dispatch to.
pub const ENV_TARGET_INTERPRETER: &str = "VX_PYTHON";
/// Set on every child the engine spawns; suppresses interactive prompts.
pub const ENV_SUBPROCESS: &str = "VX_SUBPROCESS";
/// Carries the active bubble spec (`name==version`) into children.
pub const ENV_ACTIVE_BUBBLE: &str = "VX_ACTIVE_BUBBLE";

const REGISTRY_SCHEMA: u32 = 1;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterpreterRecord {
    pub version: String,
    pub executable_path: PathBuf,
    pub managed: bool,
    pub registry_id: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    schema: u32,
    #[serde(default)]
    default: Option<String>,
    #[serde(default)]
    interpreters: BTreeMap<String, InterpreterRecord>,
}

#[derive(Debug)]
pub struct InterpreterRegistry {
    path: PathBuf,
    file: RegistryFile,
}

impl InterpreterRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let file = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            RegistryFile {
                schema: REGISTRY_SCHEMA,
                ..RegistryFile::default()
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    fn save(&self) -> Result<()> {
        let rendered = serde_json::to_string_pretty(&self.file)?;
        fsutil::atomic_write(&self.path, &rendered)
    }

    pub fn get(&self, version: &str) -> Option<&InterpreterRecord> {
        self.file.interpreters.get(version)
    }

    pub fn default_version(&self) -> Option<&str> {
        self.file.default.as_deref()
    }

    pub fn list(&self) -> impl Iterator<Item = &InterpreterRecord> {
        self.file.interpreters.values()
    }

    /// Register an interpreter. The version is probed from the executable
    /// unless given explicitly.
    pub fn adopt(
        &mut self,
        executable: &Path,
        version: Option<&str>,
        managed: bool,
    ) -> Result<InterpreterRecord> {
        let version = match version {
            Some(version) => version.to_string(),
            None => probe_version(executable)
                .ok_or_else(|| anyhow!("could not probe version of {}", executable.display()))?,
        };
        let record = InterpreterRecord {
            registry_id: format!("py{}", version.replace('.', "")),
            version: version.clone(),
            executable_path: executable.to_path_buf(),
            managed,
        };
        self.file
            .interpreters
            .insert(version.clone(), record.clone());
        if self.file.default.is_none() {
            self.file.default = Some(version);
        }
        self.save()?;
        Ok(record)
    }

    pub fn remove(&mut self, version: &str) -> Result<Option<InterpreterRecord>> {
        let removed = self.file.interpreters.remove(version);
        if self.file.default.as_deref() == Some(version) {
            self.file.default = self.file.interpreters.keys().next().cloned();
        }
        if removed.is_some() {
            self.save()?;
        }
        Ok(removed)
    }

    /// Make `version` the default (the `swap-interpreter` operation).
    pub fn set_default(&mut self, version: &str) -> Result<()> {
        if !self.file.interpreters.contains_key(version) {
            return Err(anyhow!("interpreter {version} is not registered"));
        }
        self.file.default = Some(version.to_string());
        self.save()
    }

    /// Walk managed roots for interpreter executables and reconcile the
    /// registry: new finds are adopted, managed entries whose executable
    /// vanished are dropped.
    pub fn rescan(&mut self, roots: &[PathBuf]) -> Result<RescanReport> {
        let mut report = RescanReport::default();
        let mut found: BTreeMap<String, PathBuf> = BTreeMap::new();
        for root in roots {
            for entry in WalkDir::new(root).max_depth(3).into_iter().flatten() {
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                if !looks_like_interpreter(&name) {
                    continue;
                }
                if let Some(version) = probe_version(entry.path()) {
                    found.entry(version).or_insert_with(|| entry.path().to_path_buf());
                }
            }
        }
        for (version, executable) in &found {
            if self.file.interpreters.contains_key(version) {
                continue;
            }
            debug!(version, exe = %executable.display(), "adopting interpreter from rescan");
            self.adopt(executable, Some(version), true)?;
            report.adopted.push(version.clone());
        }
        let stale: Vec<String> = self
            .file
            .interpreters
            .values()
            .filter(|record| record.managed && !record.executable_path.exists())
            .map(|record| record.version.clone())
            .collect();
        for version in stale {
            self.remove(&version)?;
            report.removed.push(version);
        }
        Ok(report)
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct RescanReport {
    pub adopted: Vec<String>,
    pub removed: Vec<String>,
}

fn looks_like_interpreter(name: &str) -> bool {
    let base = name.strip_suffix(".exe").unwrap_or(name);
    base == "python"
        || base
            .strip_prefix("python")
            .is_some_and(|rest| rest.chars().all(|c| c.is_ascii_digit() || c == '.'))
}

/// Probe `<exe> --version` and extract `major.minor`.
fn probe_version(executable: &Path) -> Option<String> {
    let output = process::run_command(
        executable,
        &["--version".to_string()],
        &[(ENV_SUBPROCESS.to_string(), "1".to_string())],
        Path::new("."),
    )
    .ok()?;
    let text = if output.stdout.trim().is_empty() {
        output.stderr
    } else {
        output.stdout
    };
    parse_version_output(&text)
}

fn parse_version_output(text: &str) -> Option<String> {
    let token = text.split_whitespace().find(|word| {
        word.chars().next().is_some_and(|c| c.is_ascii_digit()) && word.contains('.')
    })?;
    let mut parts = token.split('.');
    let major = parts.next()?;
    let minor = parts.next()?;
    if major.chars().all(|c| c.is_ascii_digit()) && minor.chars().all(|c| c.is_ascii_digit()) {
        Some(format!("{major}.{minor}"))
    } else {
        None
    }
}
