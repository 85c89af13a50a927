//! The install operation: reorder, preflight, stage, bubble or main
//! install per spec, commit, snapshot.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;
use vx_domain::{package_map, PackageSpec};

use super::{bubble_versions, fail};
use crate::core::bubble::{BubbleBuilder, BubbleError, BubbleOutcome};
use crate::core::cancel::CancelToken;
use crate::core::config::context::CommandContext;
use crate::core::errors::CoreError;
use crate::core::flock::InstallLock;
use crate::core::fsutil;
use crate::core::installer::{version_reorder, InstallerDriver, Preflight};
use crate::core::kb::keys;
use crate::core::tooling::outcome::ExecutionOutcome;

#[derive(Clone, Debug, Default)]
pub struct InstallOptions {
    pub dry_run: bool,
    /// Retry versions recorded in the failed-version cache.
    pub force: bool,
    pub cancel: CancelToken,
}

#[derive(Debug, Default, Serialize)]
struct InstallSummary {
    satisfied: Vec<String>,
    installed_main: Vec<String>,
    bubbled: Vec<String>,
    reused_bubbles: Vec<String>,
    skipped_failed: Vec<String>,
    bytes_saved: u64,
}

#[derive(Serialize, Deserialize)]
struct FailedVersion {
    reason: String,
    recorded_at: String,
}

pub fn install(ctx: &CommandContext, raw_specs: &[String], options: &InstallOptions) -> ExecutionOutcome {
    let driver = match InstallerDriver::select(
        &ctx.settings().installer_priority,
        &ctx.interpreter().executable_path,
        ctx.settings().install_timeout,
    ) {
        Ok(driver) => driver,
        Err(err) => return fail(ctx, err.into()),
    };
    install_with_driver(ctx, &driver, raw_specs, options)
}

pub fn install_with_driver(
    ctx: &CommandContext,
    driver: &InstallerDriver,
    raw_specs: &[String],
    options: &InstallOptions,
) -> ExecutionOutcome {
    match install_inner(ctx, driver, raw_specs, options) {
        Ok(outcome) => outcome,
        Err(err) => fail(ctx, err),
    }
}

fn install_inner(
    ctx: &CommandContext,
    driver: &InstallerDriver,
    raw_specs: &[String],
    options: &InstallOptions,
) -> Result<ExecutionOutcome, CoreError> {
    let mut specs = Vec::with_capacity(raw_specs.len());
    for raw in raw_specs {
        specs.push(PackageSpec::parse(raw)?);
    }
    if specs.is_empty() {
        return Err(CoreError::user("nothing to install"));
    }
    let ordered = version_reorder(&specs);
    debug!(count = ordered.len(), "install plan ordered");

    let settings = ctx.settings();
    let mut current = package_map(&settings.install_root).map_err(CoreError::Other)?;

    // Preflight: a fully-satisfied request is a no-op.
    if driver.preflight(&ordered, &current) == Preflight::Satisfied {
        return Ok(ExecutionOutcome::success(
            "all requested versions already satisfied",
            json!({ "specs": raw_specs }),
        ));
    }

    if options.dry_run {
        let plan: Vec<String> = ordered
            .iter()
            .map(|spec| {
                let action = plan_action(ctx, spec, &current);
                format!("{spec}: {action}")
            })
            .collect();
        return Ok(ExecutionOutcome::success("dry run", json!({ "plan": plan })));
    }

    // Automatic snapshot before any mutation.
    let store = ctx.snapshot_store();
    let pre_snapshot = store
        .capture(&settings.interpreter, &settings.install_root)
        .map_err(CoreError::Other)?;
    store.save_new(&pre_snapshot).map_err(CoreError::Other)?;

    let mut summary = InstallSummary::default();
    for spec in &ordered {
        if options.cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        let name = spec.name.as_str();
        let version = spec.version.to_string();

        // Already the active version: nothing to do.
        if current.get(&spec.name) == Some(&spec.version) {
            summary.satisfied.push(spec.to_string());
            continue;
        }

        // Failed-version cache: do not retry known-bad builds.
        let failed_key = keys::pkg_failed(name, &version);
        if !options.force && ctx.kb().get_json::<FailedVersion>(&failed_key)?.is_some() {
            summary.skipped_failed.push(spec.to_string());
            continue;
        }

        let is_downgrade = current
            .get(&spec.name)
            .is_some_and(|active| *active > spec.version);

        if is_downgrade {
            // Bubble path: the main environment keeps its active version.
            let builder = BubbleBuilder {
                settings,
                kb: ctx.kb(),
                driver,
                interpreter_exe: &ctx.interpreter().executable_path,
            };
            match builder.ensure_bubble(spec, &options.cancel) {
                Ok(BubbleOutcome::Built(record)) => {
                    summary.bytes_saved += record.deduped_bytes;
                    summary.bubbled.push(spec.to_string());
                }
                Ok(BubbleOutcome::Existing(_)) => {
                    summary.reused_bubbles.push(spec.to_string());
                }
                Err(err) => {
                    if matches!(err, BubbleError::VerificationFailed { .. }) {
                        ctx.kb().put_json(
                            &failed_key,
                            &FailedVersion {
                                reason: err.to_string(),
                                recorded_at: fsutil::timestamp_rfc3339(),
                            },
                        )?;
                    }
                    return Err(err.into());
                }
            }
        } else {
            // Upgrade or fresh install lands in the main environment,
            // under the cross-process lock.
            let _lock = InstallLock::acquire(
                &settings.install_root,
                &format!("install {spec}"),
                settings.lock_timeout,
            )?;
            driver.stage(
                std::slice::from_ref(spec),
                &settings.install_root,
                &current,
                "main",
            )?;
            commit_main_install(ctx, spec)?;
            current = package_map(&settings.install_root).map_err(CoreError::Other)?;
            summary.installed_main.push(spec.to_string());
        }
    }

    // Record the new last-known-good state.
    let post = store
        .capture(&settings.interpreter, &settings.install_root)
        .map_err(CoreError::Other)?;
    store.save_last_good(&post).map_err(CoreError::Other)?;

    Ok(ExecutionOutcome::success(
        "install complete",
        serde_json::to_value(&summary).unwrap_or_default(),
    ))
}

fn plan_action(
    ctx: &CommandContext,
    spec: &PackageSpec,
    current: &std::collections::BTreeMap<vx_domain::CanonicalName, pep440_rs::Version>,
) -> String {
    match current.get(&spec.name) {
        Some(active) if *active == spec.version => "already active".to_string(),
        Some(active) if *active > spec.version => {
            let key = keys::bubble(spec.name.as_str(), &spec.version.to_string());
            match ctx.kb().get(&key) {
                Ok(Some(_)) => "bubble exists".to_string(),
                _ => "create bubble".to_string(),
            }
        }
        Some(_) | None => "install into main".to_string(),
    }
}

/// Update the KB after a main-environment install: the new version becomes
/// active, and the recorded version set is exactly bubbles + active.
fn commit_main_install(ctx: &CommandContext, spec: &PackageSpec) -> Result<(), CoreError> {
    let name = spec.name.as_str();
    let version = spec.version.to_string();
    let bubbles = bubble_versions(ctx.kb(), name)?;
    let active_key = keys::pkg_active(name);
    let versions_key = keys::pkg_versions(name);
    let meta_key = keys::pkg_meta(name, &version);
    let installed_at = fsutil::timestamp_rfc3339();
    ctx.kb().transaction(|tx| {
        tx.put(&active_key, version.clone());
        let mut versions = bubbles.clone();
        if !versions.contains(&version) {
            versions.push(version.clone());
        }
        versions.sort();
        tx.put_json(&versions_key, &versions)?;
        tx.put_json(&meta_key, &json!({ "installed_at": installed_at, "location": "main" }))?;
        Ok(())
    })?;
    Ok(())
}
