#![cfg(unix)]

mod common;

use common::{test_env, write_executable};
use vx_core::api::{
    install_with_driver, kb_keys, run_script_with_driver, CommandStatus, InstallOptions,
    RunOptions,
};

/// A "script" (executed by the stub interpreter through /bin/sh) that
/// asserts a specific version of package `y` is importable; on mismatch it
/// prints a Python-shaped assertion traceback.
const VERSION_ASSERT_SCRIPT: &str = r#"first=${PYTHONPATH%%:*}
ver=$(sed -n "s/__version__ = '\(.*\)'/\1/p" "$first/y/__init__.py" 2>/dev/null)
if [ "$ver" = "1.4.2" ]; then
  echo OK
  exit 0
fi
cat >&2 <<'EOF'
Traceback (most recent call last):
  File "check.py", line 3, in <module>
    assert y.__version__ == '1.4.2'
AssertionError: 1.4.2 != 1.7.1
EOF
exit 1
"#;

#[test]
fn auto_heal_builds_the_bubble_and_reruns() {
    let env = test_env();
    // Main environment carries the newer version the script rejects.
    install_with_driver(
        &env.ctx,
        &env.driver,
        &["y==1.7.1".to_string()],
        &InstallOptions::default(),
    );

    let script = env.temp.path().join("check.py");
    write_executable(&script, VERSION_ASSERT_SCRIPT);

    let outcome = run_script_with_driver(
        &env.ctx,
        &env.driver,
        &script,
        &[],
        &RunOptions::default(),
    );
    assert_eq!(outcome.status, CommandStatus::Ok, "{outcome:?}");
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.details["healed"][0], "y==1.4.2");
    assert!(outcome.details["attempts"].as_u64().unwrap() >= 2);

    // The bubble exists; the main environment is untouched.
    assert!(env.settings.bubble_root.join("y-1.4.2").is_dir());
    let main_body =
        std::fs::read_to_string(env.settings.install_root.join("y/__init__.py")).unwrap();
    assert!(main_body.contains("1.7.1"));
    let active = env.ctx.kb().get(&kb_keys::pkg_active("y")).unwrap().unwrap();
    assert_eq!(active, "1.7.1");
}

#[test]
fn heal_disabled_surfaces_the_failure() {
    let env = test_env();
    install_with_driver(
        &env.ctx,
        &env.driver,
        &["y==1.7.1".to_string()],
        &InstallOptions::default(),
    );
    let script = env.temp.path().join("check.py");
    write_executable(&script, VERSION_ASSERT_SCRIPT);

    let options = RunOptions {
        auto_heal: false,
        ..RunOptions::default()
    };
    let outcome = run_script_with_driver(&env.ctx, &env.driver, &script, &[], &options);
    assert_eq!(outcome.status, CommandStatus::Failure);
    assert!(outcome.details["stderr_tail"]
        .as_str()
        .unwrap()
        .contains("AssertionError"));
    assert!(!env.settings.bubble_root.join("y-1.4.2").exists());
}

#[test]
fn unmatchable_failures_are_not_healed() {
    let env = test_env();
    let script = env.temp.path().join("boom.py");
    write_executable(&script, "echo 'Segmentation fault' >&2\nexit 139\n");

    let outcome = run_script_with_driver(
        &env.ctx,
        &env.driver,
        &script,
        &[],
        &RunOptions::default(),
    );
    assert_eq!(outcome.status, CommandStatus::Failure);
    assert!(outcome
        .message
        .contains("no applicable healing pattern"));
}
