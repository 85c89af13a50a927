//! Snapshot and revert operations.

use serde_json::json;
use vx_domain::{package_map, LAST_GOOD_SNAPSHOT_ID};

use super::fail;
use crate::core::cancel::CancelToken;
use crate::core::config::context::CommandContext;
use crate::core::errors::CoreError;
use crate::core::flock::InstallLock;
use crate::core::installer::InstallerDriver;
use crate::core::snapshot::{plan_revert, RevertAction};
use crate::core::tooling::outcome::ExecutionOutcome;

pub fn create_snapshot(ctx: &CommandContext) -> ExecutionOutcome {
    let settings = ctx.settings();
    let store = ctx.snapshot_store();
    let result = store
        .capture(&settings.interpreter, &settings.install_root)
        .and_then(|snapshot| {
            store.save_new(&snapshot)?;
            Ok(snapshot)
        });
    match result {
        Ok(snapshot) => ExecutionOutcome::success(
            "snapshot captured",
            json!({ "id": snapshot.id, "packages": snapshot.packages.len() }),
        ),
        Err(err) => fail(ctx, CoreError::Other(err)),
    }
}

pub fn list_snapshots(ctx: &CommandContext) -> ExecutionOutcome {
    match ctx.snapshot_store().list() {
        Ok(ids) => ExecutionOutcome::success("snapshots", json!({ "snapshots": ids })),
        Err(err) => fail(ctx, CoreError::Other(err)),
    }
}

#[derive(Clone, Debug, Default)]
pub struct RevertOptions {
    /// Compute and report the plan without executing it.
    pub plan_only: bool,
    pub cancel: CancelToken,
}

/// Revert the main environment to `snapshot_id` (default: `last-good`).
pub fn revert(ctx: &CommandContext, snapshot_id: Option<&str>, options: &RevertOptions) -> ExecutionOutcome {
    let driver = match InstallerDriver::select(
        &ctx.settings().installer_priority,
        &ctx.interpreter().executable_path,
        ctx.settings().install_timeout,
    ) {
        Ok(driver) => driver,
        Err(err) => return fail(ctx, err.into()),
    };
    revert_with_driver(ctx, &driver, snapshot_id, options)
}

pub fn revert_with_driver(
    ctx: &CommandContext,
    driver: &InstallerDriver,
    snapshot_id: Option<&str>,
    options: &RevertOptions,
) -> ExecutionOutcome {
    match revert_inner(ctx, driver, snapshot_id, options) {
        Ok(outcome) => outcome,
        Err(err) => fail(ctx, err),
    }
}

fn revert_inner(
    ctx: &CommandContext,
    driver: &InstallerDriver,
    snapshot_id: Option<&str>,
    options: &RevertOptions,
) -> Result<ExecutionOutcome, CoreError> {
    let settings = ctx.settings();
    let store = ctx.snapshot_store();
    let id = snapshot_id.unwrap_or(LAST_GOOD_SNAPSHOT_ID);
    let Some(target) = store.load(id).map_err(CoreError::Other)? else {
        return Err(CoreError::User {
            code: crate::core::tooling::diagnostics::codes::UNKNOWN_PACKAGE,
            message: format!("snapshot '{id}' does not exist"),
        });
    };

    let current = package_map(&settings.install_root).map_err(CoreError::Other)?;
    let plan = plan_revert(&current, &target);
    let rendered: Vec<String> = plan.iter().map(ToString::to_string).collect();
    if plan.is_empty() {
        return Ok(ExecutionOutcome::success(
            "environment already matches the snapshot",
            json!({ "snapshot": id, "plan": rendered }),
        ));
    }
    if options.plan_only {
        return Ok(ExecutionOutcome::success(
            "revert plan",
            json!({ "snapshot": id, "plan": rendered }),
        ));
    }

    // Record the pre-revert state; a partial failure leaves a well-defined
    // intermediate state captured right below.
    let pre = store
        .capture(&settings.interpreter, &settings.install_root)
        .map_err(CoreError::Other)?;
    store.save_new(&pre).map_err(CoreError::Other)?;

    let _lock = InstallLock::acquire(
        &settings.install_root,
        &format!("revert to {id}"),
        settings.lock_timeout,
    )?;
    let mut applied = Vec::new();
    for action in &plan {
        if options.cancel.is_cancelled() {
            record_intermediate(ctx)?;
            return Err(CoreError::Cancelled);
        }
        let step = apply_action(ctx, driver, action);
        match step {
            Ok(()) => applied.push(action.to_string()),
            Err(err) => {
                // Halt; the intermediate state is itself snapshotted.
                record_intermediate(ctx)?;
                let outcome = fail(ctx, err);
                return Ok(ExecutionOutcome {
                    status: outcome.status,
                    message: format!("revert halted after {} step(s)", applied.len()),
                    details: json!({
                        "snapshot": id,
                        "applied": applied,
                        "failed_step": action.to_string(),
                        "error": outcome.details,
                    }),
                });
            }
        }
    }

    let post = store
        .capture(&settings.interpreter, &settings.install_root)
        .map_err(CoreError::Other)?;
    store.save_last_good(&post).map_err(CoreError::Other)?;

    Ok(ExecutionOutcome::success(
        "revert complete",
        json!({ "snapshot": id, "applied": applied }),
    ))
}

fn apply_action(
    ctx: &CommandContext,
    driver: &InstallerDriver,
    action: &RevertAction,
) -> Result<(), CoreError> {
    let settings = ctx.settings();
    match action {
        RevertAction::Remove(name) => {
            driver.uninstall(std::slice::from_ref(name), &settings.install_root)?;
            ctx.kb().delete(&crate::core::kb::keys::pkg_active(name.as_str()))?;
            Ok(())
        }
        RevertAction::Install(_) | RevertAction::Fix { .. } => {
            let spec = action.install_spec().expect("install actions carry a spec");
            let current = package_map(&settings.install_root).map_err(CoreError::Other)?;
            driver.stage(&[spec.clone()], &settings.install_root, &current, "revert")?;
            ctx.kb().put(
                &crate::core::kb::keys::pkg_active(spec.name.as_str()),
                &spec.version.to_string(),
            )?;
            Ok(())
        }
    }
}

fn record_intermediate(ctx: &CommandContext) -> Result<(), CoreError> {
    let settings = ctx.settings();
    let store = ctx.snapshot_store();
    let snapshot = store
        .capture(&settings.interpreter, &settings.install_root)
        .map_err(CoreError::Other)?;
    store.save_new(&snapshot).map_err(CoreError::Other)?;
    Ok(())
}
