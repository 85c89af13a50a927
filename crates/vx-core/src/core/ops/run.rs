//! Run-script with auto-heal: execute a script under the configured
//! interpreter, analyze failures against the healing pattern table, build
//! the bubbles the script needs, and re-run with them activated.

use std::path::{Path, PathBuf};

use serde_json::json;
use tracing::{debug, warn};
use vx_domain::{package_map, PackageSpec};

use super::fail;
use crate::core::bubble::{bubble_dir, BubbleBuilder};
use crate::core::cancel::CancelToken;
use crate::core::config::context::CommandContext;
use crate::core::errors::CoreError;
use crate::core::heal::{self, HealingPlan, MAX_HEAL_ATTEMPTS};
use crate::core::installer::InstallerDriver;
use crate::core::interpreters::{ENV_ACTIVE_BUBBLE, ENV_SUBPROCESS};
use crate::core::process;
use crate::core::tooling::outcome::ExecutionOutcome;

#[derive(Clone, Debug)]
pub struct RunOptions {
    pub auto_heal: bool,
    /// Activate this bubble for the run (`name==version`).
    pub bubble: Option<String>,
    pub max_attempts: u32,
    pub cancel: CancelToken,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            auto_heal: true,
            bubble: None,
            max_attempts: MAX_HEAL_ATTEMPTS,
            cancel: CancelToken::new(),
        }
    }
}

pub fn run_script(
    ctx: &CommandContext,
    script: &Path,
    args: &[String],
    options: &RunOptions,
) -> ExecutionOutcome {
    let driver = match InstallerDriver::select(
        &ctx.settings().installer_priority,
        &ctx.interpreter().executable_path,
        ctx.settings().install_timeout,
    ) {
        Ok(driver) => driver,
        Err(err) => return fail(ctx, err.into()),
    };
    run_script_with_driver(ctx, &driver, script, args, options)
}

pub fn run_script_with_driver(
    ctx: &CommandContext,
    driver: &InstallerDriver,
    script: &Path,
    args: &[String],
    options: &RunOptions,
) -> ExecutionOutcome {
    match run_inner(ctx, driver, script, args, options) {
        Ok(outcome) => outcome,
        Err(err) => fail(ctx, err),
    }
}

fn run_inner(
    ctx: &CommandContext,
    driver: &InstallerDriver,
    script: &Path,
    args: &[String],
    options: &RunOptions,
) -> Result<ExecutionOutcome, CoreError> {
    if !script.is_file() {
        return Err(CoreError::user(format!(
            "script {} does not exist",
            script.display()
        )));
    }

    let mut bubbles: Vec<PackageSpec> = Vec::new();
    if let Some(raw) = &options.bubble {
        bubbles.push(PackageSpec::parse(raw)?);
    }

    let mut attempt: u32 = 0;
    let mut healed: Vec<String> = Vec::new();
    loop {
        attempt += 1;
        if options.cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        let output = execute_once(ctx, script, args, &bubbles)?;
        if output.success() {
            return Ok(ExecutionOutcome::success(
                "script succeeded",
                json!({
                    "attempts": attempt,
                    "healed": healed,
                    "stdout": output.stdout,
                }),
            ));
        }
        if !options.auto_heal || attempt >= options.max_attempts {
            return Ok(ExecutionOutcome::failure(
                "script failed",
                json!({
                    "attempts": attempt,
                    "exit_code": output.code,
                    "stderr_tail": output.stderr_tail(20),
                    "healed": healed,
                }),
            ));
        }

        let Some(plan) = heal::analyze(&output.stderr) else {
            debug!("no healing pattern matched; surfacing failure");
            return Ok(ExecutionOutcome::failure(
                "script failed (no applicable healing pattern)",
                json!({
                    "attempts": attempt,
                    "exit_code": output.code,
                    "stderr_tail": output.stderr_tail(20),
                }),
            ));
        };
        apply_plan(ctx, driver, &plan, &options.cancel, &mut bubbles, &mut healed)?;
    }
}

fn apply_plan(
    ctx: &CommandContext,
    driver: &InstallerDriver,
    plan: &HealingPlan,
    cancel: &CancelToken,
    bubbles: &mut Vec<PackageSpec>,
    healed: &mut Vec<String>,
) -> Result<(), CoreError> {
    let settings = ctx.settings();
    let current = package_map(&settings.install_root).map_err(CoreError::Other)?;
    for requirement in &plan.requirements {
        match &requirement.version {
            Some(version) => {
                let spec = PackageSpec::parse(&format!("{}=={version}", requirement.name))?;
                if current.get(&spec.name) == Some(&spec.version) {
                    continue;
                }
                if bubbles.contains(&spec) {
                    // Already activated and still failing; healing cannot
                    // improve on this requirement.
                    warn!(%spec, "bubble already active, skipping re-heal");
                    continue;
                }
                let builder = BubbleBuilder {
                    settings,
                    kb: ctx.kb(),
                    driver,
                    interpreter_exe: &ctx.interpreter().executable_path,
                };
                builder.ensure_bubble(&spec, cancel)?;
                healed.push(spec.to_string());
                bubbles.push(spec);
            }
            None => {
                // Unpinned: the module is missing outright; let the
                // installer resolve a version into the main environment.
                if current.contains_key(&requirement.name) {
                    continue;
                }
                debug!(name = %requirement.name, "healing missing package into main");
                driver.stage_args(
                    &[requirement.name.as_str().to_string()],
                    &settings.install_root,
                    &current,
                    "heal",
                )?;
                healed.push(requirement.name.as_str().to_string());
            }
        }
    }
    Ok(())
}

fn execute_once(
    ctx: &CommandContext,
    script: &Path,
    args: &[String],
    bubbles: &[PackageSpec],
) -> Result<process::RunOutput, CoreError> {
    let settings = ctx.settings();
    let mut search_path: Vec<PathBuf> = Vec::new();
    for spec in bubbles {
        search_path.push(bubble_dir(&settings.bubble_root, spec));
    }
    search_path.push(settings.install_root.clone());

    let sep = if cfg!(windows) { ";" } else { ":" };
    let pythonpath = search_path
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(sep);

    let mut envs: Vec<(String, String)> = vec![
        ("PYTHONPATH".to_string(), pythonpath),
        (ENV_SUBPROCESS.to_string(), "1".to_string()),
    ];
    if let Some(first) = bubbles.first() {
        envs.push((ENV_ACTIVE_BUBBLE.to_string(), first.to_string()));
    }

    let mut argv = vec![script.display().to_string()];
    argv.extend(args.iter().cloned());
    let cwd = script
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    process::run_command_with_timeout(
        &ctx.interpreter().executable_path,
        &argv,
        &envs,
        &cwd,
        settings.install_timeout,
    )
    .map_err(CoreError::Other)
}
