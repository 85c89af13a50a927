//! Uninstall: remove bubble versions, or the whole package including its
//! main-environment install.

use std::fs;

use serde::Serialize;
use tracing::debug;
use vx_domain::{package_map, split_requirement, CanonicalName};

use super::{bubble_versions, fail};
use crate::core::bubble::BubbleRecord;
use crate::core::config::context::CommandContext;
use crate::core::errors::CoreError;
use crate::core::flock::InstallLock;
use crate::core::installer::InstallerDriver;
use crate::core::kb::keys;
use crate::core::tooling::outcome::ExecutionOutcome;

#[derive(Clone, Debug, Default)]
pub struct UninstallOptions {
    /// Allow removing the active (main-environment) version.
    pub force: bool,
}

#[derive(Debug, Default, Serialize)]
struct UninstallSummary {
    bubbles_removed: Vec<String>,
    main_removed: Vec<String>,
}

/// `targets` are bare names (everything goes) or `name==version` pins
/// (that version's bubble only; the active version needs `force`).
pub fn uninstall(ctx: &CommandContext, targets: &[String], options: &UninstallOptions) -> ExecutionOutcome {
    match uninstall_inner(ctx, targets, options) {
        Ok(outcome) => outcome,
        Err(err) => fail(ctx, err),
    }
}

fn uninstall_inner(
    ctx: &CommandContext,
    targets: &[String],
    options: &UninstallOptions,
) -> Result<ExecutionOutcome, CoreError> {
    if targets.is_empty() {
        return Err(CoreError::user("nothing to uninstall"));
    }
    let settings = ctx.settings();
    let driver = InstallerDriver::select(
        &settings.installer_priority,
        &ctx.interpreter().executable_path,
        settings.install_timeout,
    )?;
    let current = package_map(&settings.install_root).map_err(CoreError::Other)?;

    let store = ctx.snapshot_store();
    let pre = store
        .capture(&settings.interpreter, &settings.install_root)
        .map_err(CoreError::Other)?;
    store.save_new(&pre).map_err(CoreError::Other)?;

    let mut summary = UninstallSummary::default();
    for target in targets {
        let (name, pin) = split_requirement(target)?;
        if let Some(version) = pin {
            let active = current.get(&name) == Some(&version);
            if active {
                if !options.force {
                    return Err(CoreError::User {
                        code: crate::core::tooling::diagnostics::codes::BAD_SPEC,
                        message: format!(
                            "{name}=={version} is the active version; pass force to remove it from main"
                        ),
                    });
                }
                remove_from_main(ctx, &driver, &name, &mut summary)?;
            } else {
                remove_bubble(ctx, name.as_str(), &version.to_string(), &mut summary)?;
            }
        } else {
            let versions = bubble_versions(ctx.kb(), name.as_str())?;
            let in_main = current.contains_key(&name);
            if versions.is_empty() && !in_main {
                return Err(CoreError::unknown_package(name.as_str()));
            }
            for version in versions {
                remove_bubble(ctx, name.as_str(), &version, &mut summary)?;
            }
            if in_main {
                remove_from_main(ctx, &driver, &name, &mut summary)?;
            }
            // No versions remain: the package record goes away entirely.
            ctx.kb().delete(&keys::pkg_versions(name.as_str()))?;
            ctx.kb().delete(&keys::pkg_active(name.as_str()))?;
        }
    }

    let post = store
        .capture(&settings.interpreter, &settings.install_root)
        .map_err(CoreError::Other)?;
    store.save_last_good(&post).map_err(CoreError::Other)?;

    Ok(ExecutionOutcome::success(
        "uninstall complete",
        serde_json::to_value(&summary).unwrap_or_default(),
    ))
}

fn remove_bubble(
    ctx: &CommandContext,
    name: &str,
    version: &str,
    summary: &mut UninstallSummary,
) -> Result<(), CoreError> {
    let record_key = keys::bubble(name, version);
    let record: Option<BubbleRecord> = ctx.kb().get_json(&record_key)?;
    let dir = record
        .as_ref()
        .map(|r| r.root_path.clone())
        .unwrap_or_else(|| ctx.settings().bubble_root.join(format!("{name}-{version}")));
    if dir.exists() {
        fs::remove_dir_all(&dir)
            .map_err(|err| CoreError::Other(anyhow::anyhow!(
                "failed to remove bubble {}: {err}",
                dir.display()
            )))?;
    }
    let versions_key = keys::pkg_versions(name);
    let version_owned = version.to_string();
    ctx.kb().transaction(|tx| {
        tx.delete(&record_key);
        let mut versions: Vec<String> = tx.get_json(&versions_key)?.unwrap_or_default();
        versions.retain(|v| v != &version_owned);
        tx.put_json(&versions_key, &versions)?;
        Ok(())
    })?;
    debug!(name, version, "removed bubble");
    summary.bubbles_removed.push(format!("{name}-{version}"));
    Ok(())
}

fn remove_from_main(
    ctx: &CommandContext,
    driver: &InstallerDriver,
    name: &CanonicalName,
    summary: &mut UninstallSummary,
) -> Result<(), CoreError> {
    let settings = ctx.settings();
    let _lock = InstallLock::acquire(
        &settings.install_root,
        &format!("uninstall {name}"),
        settings.lock_timeout,
    )?;
    let removed = driver.uninstall(std::slice::from_ref(name), &settings.install_root)?;
    let bubbles = bubble_versions(ctx.kb(), name.as_str())?;
    let active_key = keys::pkg_active(name.as_str());
    let versions_key = keys::pkg_versions(name.as_str());
    ctx.kb().transaction(|tx| {
        tx.delete(&active_key);
        if bubbles.is_empty() {
            tx.delete(&versions_key);
        } else {
            tx.put_json(&versions_key, &bubbles)?;
        }
        Ok(())
    })?;
    for name in removed {
        summary.main_removed.push(name.as_str().to_string());
    }
    Ok(())
}
