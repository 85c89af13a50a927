//! Per-interpreter configuration, persisted as TOML.

use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use toml_edit::{value, Array, DocumentMut, Item};

pub const STATE_DIR_ENV: &str = "VX_STATE_DIR";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum KbBackendChoice {
    #[default]
    Auto,
    Fast,
    Embedded,
}

impl KbBackendChoice {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Fast => "fast",
            Self::Embedded => "embedded",
        }
    }
}

impl FromStr for KbBackendChoice {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "auto" => Ok(Self::Auto),
            "fast" => Ok(Self::Fast),
            "embedded" => Ok(Self::Embedded),
            other => Err(anyhow!("unknown kb_backend '{other}'")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DedupPolicy {
    /// Dedup via symlinks into the main environment.
    Aggressive,
    /// Dedup via hard links, copying across devices.
    #[default]
    Conservative,
    /// Always copy.
    Off,
}

impl DedupPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aggressive => "aggressive",
            Self::Conservative => "conservative",
            Self::Off => "off",
        }
    }
}

impl FromStr for DedupPolicy {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "aggressive" => Ok(Self::Aggressive),
            "conservative" => Ok(Self::Conservative),
            "off" => Ok(Self::Off),
            other => Err(anyhow!("unknown dedup_policy '{other}'")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DaemonSettings {
    pub max_workers: usize,
    pub idle_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            max_workers: 4,
            idle_timeout: Duration::from_secs(300),
            request_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Clone, Debug)]
pub struct InterpreterSettings {
    /// Interpreter version this configuration belongs to, e.g. `3.11`.
    pub interpreter: String,
    /// The interpreter's canonical package directory.
    pub install_root: PathBuf,
    /// Where bubbles are materialized.
    pub bubble_root: PathBuf,
    /// Engine state (KB, snapshots) for this interpreter.
    pub state_root: PathBuf,
    pub kb_backend: KbBackendChoice,
    pub kb_endpoint: Option<String>,
    pub installer_priority: Vec<String>,
    pub language_code: String,
    pub dedup_policy: DedupPolicy,
    /// Names excluded from dedup on top of native-code detection.
    pub native_package_list: BTreeSet<String>,
    pub lock_timeout: Duration,
    pub install_timeout: Duration,
    pub daemon: DaemonSettings,
}

impl InterpreterSettings {
    pub fn defaults(interpreter: &str, install_root: &Path) -> Self {
        Self {
            interpreter: interpreter.to_string(),
            install_root: install_root.to_path_buf(),
            bubble_root: install_root.join(".vx-bubbles"),
            state_root: default_state_root(interpreter),
            kb_backend: KbBackendChoice::Auto,
            kb_endpoint: None,
            installer_priority: vec!["uv".to_string(), "pip".to_string()],
            language_code: "en".to_string(),
            dedup_policy: DedupPolicy::default(),
            native_package_list: BTreeSet::new(),
            lock_timeout: Duration::from_secs(60),
            install_timeout: Duration::from_secs(600),
            daemon: DaemonSettings::default(),
        }
    }

    pub fn kb_embedded_path(&self) -> PathBuf {
        self.state_root.join("kb.sqlite")
    }

    pub fn kb_resident_endpoint(&self) -> PathBuf {
        match &self.kb_endpoint {
            Some(endpoint) => PathBuf::from(endpoint.strip_prefix("file:").unwrap_or(endpoint)),
            None => self.state_root.join("kb-fast"),
        }
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.state_root.join("snapshots")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.state_root.join("staging")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let doc: DocumentMut = raw
            .parse()
            .with_context(|| format!("failed to parse {}", path.display()))?;

        let interpreter = required_str(&doc, "interpreter")?;
        let install_root = PathBuf::from(required_str(&doc, "install_root")?);
        let mut settings = Self::defaults(&interpreter, &install_root);

        if let Some(bubble_root) = optional_str(&doc, "bubble_root") {
            settings.bubble_root = PathBuf::from(bubble_root);
        }
        if let Some(state_root) = optional_str(&doc, "state_root") {
            settings.state_root = PathBuf::from(state_root);
        }
        if let Some(backend) = optional_str(&doc, "kb_backend") {
            settings.kb_backend = backend.parse()?;
        }
        settings.kb_endpoint = optional_str(&doc, "kb_endpoint");
        if let Some(priority) = doc.get("installer_priority").and_then(Item::as_array) {
            settings.installer_priority = priority
                .iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect();
        }
        if let Some(language) = optional_str(&doc, "language_code") {
            settings.language_code = language;
        }
        if let Some(policy) = optional_str(&doc, "dedup_policy") {
            settings.dedup_policy = policy.parse()?;
        }
        if let Some(list) = doc.get("native_package_list").and_then(Item::as_array) {
            settings.native_package_list = list
                .iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect();
        }
        if let Some(secs) = doc.get("lock_timeout_secs").and_then(Item::as_integer) {
            settings.lock_timeout = Duration::from_secs(secs.max(0) as u64);
        }
        if let Some(secs) = doc.get("install_timeout_secs").and_then(Item::as_integer) {
            settings.install_timeout = Duration::from_secs(secs.max(0) as u64);
        }
        if let Some(daemon) = doc.get("daemon").and_then(Item::as_table) {
            if let Some(max) = daemon.get("max_workers").and_then(Item::as_integer) {
                settings.daemon.max_workers = max.max(1) as usize;
            }
            if let Some(secs) = daemon.get("idle_timeout_secs").and_then(Item::as_integer) {
                settings.daemon.idle_timeout = Duration::from_secs(secs.max(0) as u64);
            }
            if let Some(secs) = daemon.get("request_timeout_secs").and_then(Item::as_integer) {
                settings.daemon.request_timeout = Duration::from_secs(secs.max(1) as u64);
            }
        }
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut doc = DocumentMut::new();
        doc["interpreter"] = value(self.interpreter.as_str());
        doc["install_root"] = value(self.install_root.display().to_string());
        doc["bubble_root"] = value(self.bubble_root.display().to_string());
        doc["state_root"] = value(self.state_root.display().to_string());
        doc["kb_backend"] = value(self.kb_backend.as_str());
        if let Some(endpoint) = &self.kb_endpoint {
            doc["kb_endpoint"] = value(endpoint.as_str());
        }
        let mut priority = Array::new();
        for tool in &self.installer_priority {
            priority.push(tool.as_str());
        }
        doc["installer_priority"] = value(priority);
        doc["language_code"] = value(self.language_code.as_str());
        doc["dedup_policy"] = value(self.dedup_policy.as_str());
        let mut natives = Array::new();
        for name in &self.native_package_list {
            natives.push(name.as_str());
        }
        doc["native_package_list"] = value(natives);
        doc["lock_timeout_secs"] = value(self.lock_timeout.as_secs() as i64);
        doc["install_timeout_secs"] = value(self.install_timeout.as_secs() as i64);
        doc["daemon"] = Item::Table(toml_edit::Table::new());
        doc["daemon"]["max_workers"] = value(self.daemon.max_workers as i64);
        doc["daemon"]["idle_timeout_secs"] = value(self.daemon.idle_timeout.as_secs() as i64);
        doc["daemon"]["request_timeout_secs"] =
            value(self.daemon.request_timeout.as_secs() as i64);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(path, doc.to_string())
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

fn default_state_root(interpreter: &str) -> PathBuf {
    if let Ok(dir) = env::var(STATE_DIR_ENV) {
        return PathBuf::from(dir).join(interpreter);
    }
    dirs_next::data_local_dir()
        .unwrap_or_else(env::temp_dir)
        .join("vx")
        .join(interpreter)
}

fn required_str(doc: &DocumentMut, key: &str) -> Result<String> {
    optional_str(doc, key).ok_or_else(|| anyhow!("config is missing '{key}'"))
}

fn optional_str(doc: &DocumentMut, key: &str) -> Option<String> {
    doc.get(key)
        .and_then(Item::as_str)
        .map(ToString::to_string)
}
