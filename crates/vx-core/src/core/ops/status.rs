//! Read-only surface: status, list, info.

use serde_json::json;
use vx_domain::{package_map, CanonicalName};

use super::{bubble_versions, fail};
use crate::core::bubble::BubbleRecord;
use crate::core::config::context::CommandContext;
use crate::core::errors::CoreError;
use crate::core::kb::keys;
use crate::core::tooling::outcome::ExecutionOutcome;

pub fn status(ctx: &CommandContext) -> ExecutionOutcome {
    match status_inner(ctx) {
        Ok(outcome) => outcome,
        Err(err) => fail(ctx, err),
    }
}

fn status_inner(ctx: &CommandContext) -> Result<ExecutionOutcome, CoreError> {
    let settings = ctx.settings();
    let packages = package_map(&settings.install_root).map_err(CoreError::Other)?;

    let mut bubble_count = 0usize;
    let mut bubble_bytes = 0u64;
    let mut saved_bytes = 0u64;
    for key in ctx.kb().scan(keys::BUBBLE_PREFIX)? {
        if key.ends_with(":build") {
            continue;
        }
        if let Some(record) = ctx.kb().get_json::<BubbleRecord>(&key)? {
            bubble_count += 1;
            bubble_bytes += record.size_bytes;
            saved_bytes += record.deduped_bytes;
        }
    }
    let snapshots = ctx.snapshot_store().list().map_err(CoreError::Other)?;

    Ok(ExecutionOutcome::success(
        "status",
        json!({
            "interpreter": settings.interpreter,
            "install_root": settings.install_root.display().to_string(),
            "active_packages": packages.len(),
            "bubbles": bubble_count,
            "bubble_bytes": bubble_bytes,
            "bytes_saved_by_dedup": saved_bytes,
            "snapshots": snapshots.len(),
            "kb_backend": ctx.kb().backend_label(),
            "daemon_started": ctx.pool_started(),
        }),
    ))
}

/// List installed packages with their active version and bubbled versions,
/// optionally filtered by a substring pattern.
pub fn list_packages(ctx: &CommandContext, pattern: Option<&str>) -> ExecutionOutcome {
    match list_inner(ctx, pattern) {
        Ok(outcome) => outcome,
        Err(err) => fail(ctx, err),
    }
}

fn list_inner(ctx: &CommandContext, pattern: Option<&str>) -> Result<ExecutionOutcome, CoreError> {
    let settings = ctx.settings();
    let packages = package_map(&settings.install_root).map_err(CoreError::Other)?;
    let mut rows = Vec::new();
    for (name, version) in &packages {
        if let Some(pattern) = pattern {
            if !name.as_str().contains(pattern) {
                continue;
            }
        }
        let bubbles = bubble_versions(ctx.kb(), name.as_str())?;
        rows.push(json!({
            "name": name.as_str(),
            "active": version.to_string(),
            "bubbles": bubbles,
        }));
    }
    Ok(ExecutionOutcome::success(
        "packages",
        json!({ "packages": rows }),
    ))
}

pub fn package_info(ctx: &CommandContext, name: &str, version: Option<&str>) -> ExecutionOutcome {
    match info_inner(ctx, name, version) {
        Ok(outcome) => outcome,
        Err(err) => fail(ctx, err),
    }
}

fn info_inner(
    ctx: &CommandContext,
    raw_name: &str,
    version: Option<&str>,
) -> Result<ExecutionOutcome, CoreError> {
    let name = CanonicalName::new(raw_name);
    let settings = ctx.settings();
    let packages = package_map(&settings.install_root).map_err(CoreError::Other)?;
    let active = packages.get(&name).map(ToString::to_string);
    let bubbles = bubble_versions(ctx.kb(), name.as_str())?;
    if active.is_none() && bubbles.is_empty() {
        return Err(CoreError::unknown_package(name.as_str()));
    }

    let mut details = json!({
        "name": name.as_str(),
        "active": active,
        "bubbled_versions": bubbles,
    });
    if let Some(version) = version {
        let record: Option<BubbleRecord> =
            ctx.kb().get_json(&keys::bubble(name.as_str(), version))?;
        let meta: Option<serde_json::Value> =
            ctx.kb().get_json(&keys::pkg_meta(name.as_str(), version))?;
        details["version"] = json!(version);
        details["bubble"] = serde_json::to_value(record).unwrap_or_default();
        details["meta"] = meta.unwrap_or_default();
    }
    Ok(ExecutionOutcome::success("package info", details))
}
