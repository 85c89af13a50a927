#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use vx_core::api::{
    CommandContext, InstallerDriver, InstallerTool, InterpreterRecord, InterpreterSettings,
    KbBackendChoice,
};

pub struct TestEnv {
    pub temp: TempDir,
    pub settings: InterpreterSettings,
    pub ctx: CommandContext,
    pub driver: InstallerDriver,
    pub installer: PathBuf,
    pub interpreter: PathBuf,
}

/// Fake installer honoring the generic tool contract: for every
/// `name==version` spec it lays down a module dir (version-stamped
/// `__init__.py`, version-independent `common.py`), a dist-info with
/// METADATA/RECORD/top_level.txt, and appends to a per-environment build
/// log. Unpinned specs resolve to 9.0.0.
const FAKE_INSTALLER: &str = r#"#!/bin/sh
echo "run$*" >> "$(dirname "$0")/builds.log"
target=""; report=""; args=""
while [ $# -gt 0 ]; do
  case "$1" in
    --target) target="$2"; shift 2;;
    --report) report="$2"; shift 2;;
    install|--quiet|--no-input) shift;;
    *) args="$args $1"; shift;;
  esac
done
entries=""
for spec in $args; do
  name=${spec%%==*}
  ver=${spec#*==}
  if [ "$ver" = "$spec" ]; then ver="9.0.0"; fi
  rm -rf "$target/$name"-*.dist-info
  mkdir -p "$target/$name"
  printf "__version__ = '%s'\n" "$ver" > "$target/$name/__init__.py"
  printf "shared = True\n" > "$target/$name/common.py"
  di="$target/$name-$ver.dist-info"
  mkdir -p "$di"
  printf 'Metadata-Version: 2.1\nName: %s\nVersion: %s\n' "$name" "$ver" > "$di/METADATA"
  printf '%s\n' "$name" > "$di/top_level.txt"
  printf '%s/__init__.py,,\n%s/common.py,,\n%s-%s.dist-info/METADATA,,\n%s-%s.dist-info/top_level.txt,,\n' \
    "$name" "$name" "$name" "$ver" "$name" "$ver" > "$di/RECORD"
  entries="$entries{\"metadata\": {\"name\": \"$name\", \"version\": \"$ver\"}},"
done
entries=${entries%,}
if [ -n "$report" ]; then
  printf '{"version": "1", "install": [%s]}' "$entries" > "$report"
fi
exit 0
"#;

/// Stub interpreter: answers `--version`, smoke-imports against the first
/// PYTHONPATH entry, and otherwise executes the target as a shell script
/// (tests write their "Python" scripts in sh).
const STUB_INTERPRETER: &str = r#"#!/bin/sh
if [ "$1" = "--version" ]; then
  echo "Python 3.11.9"
  exit 0
fi
if [ "$1" = "-c" ]; then
  mod=$(printf '%s' "$2" | sed 's/^import //')
  first=${PYTHONPATH%%:*}
  if [ -e "$first/$mod" ] || [ -e "$first/$mod.py" ]; then
    exit 0
  fi
  echo "ModuleNotFoundError: No module named '$mod'" >&2
  exit 1
fi
exec /bin/sh "$@"
"#;

pub fn write_executable(path: &Path, body: &str) {
    fs::write(path, body).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }
}

pub fn test_env() -> TestEnv {
    let temp = tempfile::tempdir().unwrap();
    let installer = temp.path().join("fake-installer");
    write_executable(&installer, FAKE_INSTALLER);
    let interpreter = temp.path().join("python-stub");
    write_executable(&interpreter, STUB_INTERPRETER);

    let mut settings = InterpreterSettings::defaults("3.11", &temp.path().join("site"));
    settings.bubble_root = temp.path().join("bubbles");
    settings.state_root = temp.path().join("state");
    settings.kb_backend = KbBackendChoice::Embedded;
    settings.installer_priority = vec!["pip".to_string()];
    settings.lock_timeout = Duration::from_secs(5);
    settings.install_timeout = Duration::from_secs(30);
    fs::create_dir_all(&settings.install_root).unwrap();
    fs::create_dir_all(&settings.bubble_root).unwrap();

    let record = InterpreterRecord {
        version: "3.11".to_string(),
        executable_path: interpreter.clone(),
        managed: false,
        registry_id: "py311".to_string(),
    };
    let ctx = CommandContext::new(settings.clone(), record).unwrap();
    let driver = InstallerDriver::with_tool(
        InstallerTool {
            name: "fake".to_string(),
            program: installer.clone(),
        },
        &interpreter,
        Duration::from_secs(30),
    );
    TestEnv {
        temp,
        settings,
        ctx,
        driver,
        installer,
        interpreter,
    }
}

/// Lines the fake installer appended, one per invocation.
pub fn build_log(env: &TestEnv) -> Vec<String> {
    let path = env.temp.path().join("builds.log");
    if !path.exists() {
        return Vec::new();
    }
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(ToString::to_string)
        .collect()
}
