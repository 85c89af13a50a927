//! Import verification: smoke-import every module a bubble provides inside
//! an isolated subprocess, classify failures, and apply targeted repairs
//! from the staging root.

use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Context;
use regex::Regex;
use tracing::{debug, warn};

use super::BubbleError;
use crate::core::fsutil;
use crate::core::interpreters::{ENV_ACTIVE_BUBBLE, ENV_SUBPROCESS};
use crate::core::process;

const IMPORT_TIMEOUT: Duration = Duration::from_secs(60);
pub const MAX_REPAIR_ATTEMPTS: usize = 3;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImportFailureClass {
    ModuleNotFound { module: String },
    SymbolNotFound { detail: String },
    AbiError { detail: String },
    Other { detail: String },
}

/// Classify an interpreter's stderr from a failed import.
pub fn classify_import_failure(stderr: &str) -> ImportFailureClass {
    static MODULE_RE: OnceLock<Regex> = OnceLock::new();
    static SYMBOL_RE: OnceLock<Regex> = OnceLock::new();
    static ABI_RE: OnceLock<Regex> = OnceLock::new();

    let module_re = MODULE_RE.get_or_init(|| {
        Regex::new(r"ModuleNotFoundError: No module named '([^']+)'").expect("static regex")
    });
    let symbol_re = SYMBOL_RE.get_or_init(|| {
        Regex::new(r"undefined symbol:?\s*(\S+)|ImportError: cannot import name '([^']+)'")
            .expect("static regex")
    });
    let abi_re = ABI_RE.get_or_init(|| {
        Regex::new(r"(dtype size changed|binary incompatibility|GLIBC_[\d.]+' not found|ABI)")
            .expect("static regex")
    });

    if let Some(caps) = module_re.captures(stderr) {
        return ImportFailureClass::ModuleNotFound {
            module: caps[1].to_string(),
        };
    }
    if let Some(caps) = abi_re.captures(stderr) {
        return ImportFailureClass::AbiError {
            detail: caps[1].to_string(),
        };
    }
    if let Some(caps) = symbol_re.captures(stderr) {
        let detail = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        return ImportFailureClass::SymbolNotFound { detail };
    }
    let tail: Vec<&str> = stderr.lines().rev().take(3).collect();
    ImportFailureClass::Other {
        detail: tail.into_iter().rev().collect::<Vec<_>>().join(" | "),
    }
}

#[derive(Debug, Default)]
pub struct VerifyOutcome {
    pub verified: Vec<String>,
    pub repairs: usize,
    pub failures: Vec<(String, ImportFailureClass)>,
}

impl VerifyOutcome {
    pub fn ok(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct ImportVerifier<'a> {
    pub interpreter: &'a Path,
    pub main_root: &'a Path,
    pub staged_root: &'a Path,
}

impl ImportVerifier<'_> {
    /// Smoke-import every module inside a subprocess that sees only the
    /// bubble plus the main environment. `ModuleNotFound` failures trigger
    /// copy-repairs from the staging root, up to a small bound.
    pub fn verify(
        &self,
        bubble_dir: &Path,
        modules: &[String],
        spec: &str,
    ) -> Result<VerifyOutcome, BubbleError> {
        let mut outcome = VerifyOutcome::default();
        for module in modules {
            let mut attempts = 0;
            loop {
                match self.smoke_import(bubble_dir, module, spec)? {
                    None => {
                        outcome.verified.push(module.clone());
                        break;
                    }
                    Some(failure) => {
                        attempts += 1;
                        if attempts > MAX_REPAIR_ATTEMPTS {
                            outcome.failures.push((module.clone(), failure));
                            break;
                        }
                        match &failure {
                            ImportFailureClass::ModuleNotFound { module: missing } => {
                                if self.repair_missing(bubble_dir, missing)? {
                                    outcome.repairs += 1;
                                    debug!(module = %missing, "repaired missing module from stage root");
                                    continue;
                                }
                                outcome.failures.push((module.clone(), failure));
                                break;
                            }
                            _ => {
                                warn!(module = %module, ?failure, "import verification failed");
                                outcome.failures.push((module.clone(), failure));
                                break;
                            }
                        }
                    }
                }
            }
        }
        Ok(outcome)
    }

    fn smoke_import(
        &self,
        bubble_dir: &Path,
        module: &str,
        spec: &str,
    ) -> Result<Option<ImportFailureClass>, BubbleError> {
        let search_path = format!(
            "{}{}{}",
            bubble_dir.display(),
            if cfg!(windows) { ";" } else { ":" },
            self.main_root.display()
        );
        let envs = vec![
            ("PYTHONPATH".to_string(), search_path),
            ("PYTHONNOUSERSITE".to_string(), "1".to_string()),
            (ENV_SUBPROCESS.to_string(), "1".to_string()),
            (ENV_ACTIVE_BUBBLE.to_string(), spec.to_string()),
        ];
        let output = process::run_command_with_timeout(
            self.interpreter,
            &["-c".to_string(), format!("import {module}")],
            &envs,
            bubble_dir,
            IMPORT_TIMEOUT,
        )
        .map_err(BubbleError::Io)?;
        if output.timed_out {
            return Ok(Some(ImportFailureClass::Other {
                detail: format!("import of {module} timed out"),
            }));
        }
        if output.code == 0 {
            return Ok(None);
        }
        Ok(Some(classify_import_failure(&output.stderr)))
    }

    /// Copy a missing module's files from the staging root into the
    /// bubble. Returns false when the stage has nothing to offer.
    fn repair_missing(&self, bubble_dir: &Path, module: &str) -> Result<bool, BubbleError> {
        let top = module.split('.').next().unwrap_or(module);
        let candidates = [
            (self.staged_root.join(top), bubble_dir.join(top)),
            (
                self.staged_root.join(format!("{top}.py")),
                bubble_dir.join(format!("{top}.py")),
            ),
        ];
        for (source, target) in candidates {
            if source.is_dir() {
                fsutil::copy_tree(&source, &target).map_err(BubbleError::Io)?;
                return Ok(true);
            }
            if source.is_file() {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)
                        .context("failed to create repair target dir")
                        .map_err(BubbleError::Io)?;
                }
                std::fs::copy(&source, &target)
                    .context("failed to copy repair file")
                    .map_err(BubbleError::Io)?;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_module_not_found() {
        let stderr = "Traceback (most recent call last):\n  File \"<string>\", line 1\nModuleNotFoundError: No module named 'werkzeug'";
        assert_eq!(
            classify_import_failure(stderr),
            ImportFailureClass::ModuleNotFound {
                module: "werkzeug".to_string()
            }
        );
    }

    #[test]
    fn classifies_symbol_errors() {
        let stderr = "ImportError: /x/y.so: undefined symbol: PyFloat_Type";
        assert!(matches!(
            classify_import_failure(stderr),
            ImportFailureClass::SymbolNotFound { .. }
        ));
        let stderr = "ImportError: cannot import name 'soft_unicode'";
        assert!(matches!(
            classify_import_failure(stderr),
            ImportFailureClass::SymbolNotFound { .. }
        ));
    }

    #[test]
    fn classifies_abi_errors() {
        let stderr = "ValueError: numpy.dtype size changed, may indicate binary incompatibility";
        assert!(matches!(
            classify_import_failure(stderr),
            ImportFailureClass::AbiError { .. }
        ));
    }

    #[test]
    fn unknown_errors_keep_a_tail() {
        let failure = classify_import_failure("one\ntwo\nSegmentation fault");
        match failure {
            ImportFailureClass::Other { detail } => assert!(detail.contains("Segmentation fault")),
            other => panic!("unexpected class: {other:?}"),
        }
    }

    #[cfg(unix)]
    mod subprocess {
        use super::*;
        use std::fs;
        use std::os::unix::fs::PermissionsExt;
        use std::path::PathBuf;

        /// Stub interpreter: `import m` succeeds when the first PYTHONPATH
        /// entry contains the module, otherwise prints ModuleNotFoundError.
        fn stub_interpreter(dir: &Path) -> PathBuf {
            let path = dir.join("python-stub");
            fs::write(
                &path,
                r#"#!/bin/sh
mod=$(printf '%s' "$2" | sed 's/^import //')
first=${PYTHONPATH%%:*}
if [ -e "$first/$mod" ] || [ -e "$first/$mod.py" ]; then
  exit 0
fi
echo "ModuleNotFoundError: No module named '$mod'" >&2
exit 1
"#,
            )
            .unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        #[test]
        fn verifies_present_module() {
            let temp = tempfile::tempdir().unwrap();
            let interpreter = stub_interpreter(temp.path());
            let bubble = temp.path().join("bubble");
            fs::create_dir_all(bubble.join("flask")).unwrap();
            let main = temp.path().join("main");
            let staged = temp.path().join("staged");
            fs::create_dir_all(&main).unwrap();
            fs::create_dir_all(&staged).unwrap();

            let verifier = ImportVerifier {
                interpreter: &interpreter,
                main_root: &main,
                staged_root: &staged,
            };
            let outcome = verifier
                .verify(&bubble, &["flask".to_string()], "flask==2.0.1")
                .unwrap();
            assert!(outcome.ok());
            assert_eq!(outcome.verified, vec!["flask"]);
        }

        #[test]
        fn repairs_missing_module_from_stage() {
            let temp = tempfile::tempdir().unwrap();
            let interpreter = stub_interpreter(temp.path());
            let bubble = temp.path().join("bubble");
            fs::create_dir_all(&bubble).unwrap();
            let main = temp.path().join("main");
            fs::create_dir_all(&main).unwrap();
            let staged = temp.path().join("staged");
            fs::create_dir_all(staged.join("flask")).unwrap();
            fs::write(staged.join("flask/__init__.py"), "").unwrap();

            let verifier = ImportVerifier {
                interpreter: &interpreter,
                main_root: &main,
                staged_root: &staged,
            };
            let outcome = verifier
                .verify(&bubble, &["flask".to_string()], "flask==2.0.1")
                .unwrap();
            assert!(outcome.ok());
            assert_eq!(outcome.repairs, 1);
            assert!(bubble.join("flask/__init__.py").exists());
        }

        #[test]
        fn unrepairable_module_is_reported() {
            let temp = tempfile::tempdir().unwrap();
            let interpreter = stub_interpreter(temp.path());
            let bubble = temp.path().join("bubble");
            fs::create_dir_all(&bubble).unwrap();
            let main = temp.path().join("main");
            let staged = temp.path().join("staged");
            fs::create_dir_all(&main).unwrap();
            fs::create_dir_all(&staged).unwrap();

            let verifier = ImportVerifier {
                interpreter: &interpreter,
                main_root: &main,
                staged_root: &staged,
            };
            let outcome = verifier
                .verify(&bubble, &["ghost".to_string()], "ghost==1.0")
                .unwrap();
            assert!(!outcome.ok());
            assert!(matches!(
                outcome.failures[0].1,
                ImportFailureClass::ModuleNotFound { .. }
            ));
        }
    }
}
