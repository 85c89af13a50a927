//! Doctor, prune, and KB rebuild operations.

use std::fs;

use serde_json::json;

use super::{bubble_versions, fail};
use crate::core::bubble::BubbleRecord;
use crate::core::config::context::CommandContext;
use crate::core::errors::CoreError;
use crate::core::health;
use crate::core::kb::keys;
use crate::core::tooling::outcome::ExecutionOutcome;

/// Consistency check: reconcile KB and filesystem, then re-hash every
/// registered bubble. With `repair`, corrupted bubbles are dropped so the
/// next install rebuilds them.
pub fn doctor(ctx: &CommandContext, repair: bool) -> ExecutionOutcome {
    match doctor_inner(ctx, repair) {
        Ok(outcome) => outcome,
        Err(err) => fail(ctx, err),
    }
}

fn doctor_inner(ctx: &CommandContext, repair: bool) -> Result<ExecutionOutcome, CoreError> {
    let settings = ctx.settings();
    let scan = health::scan_bubbles(ctx.kb(), settings).map_err(CoreError::Other)?;

    let mut verified = 0usize;
    let mut corrupted: Vec<String> = Vec::new();
    let mut dropped: Vec<String> = Vec::new();
    for key in ctx.kb().scan(keys::BUBBLE_PREFIX)? {
        if key.ends_with(":build") {
            continue;
        }
        let Some(record) = ctx.kb().get_json::<BubbleRecord>(&key)? else {
            continue;
        };
        let report = health::verify_bubble(settings, &record.package, &record.version)
            .map_err(CoreError::Other)?;
        verified += 1;
        if !report.ok() {
            let label = format!("{}-{}", record.package, record.version);
            corrupted.push(label.clone());
            if repair {
                drop_bubble(ctx, &record)?;
                dropped.push(label);
            }
        }
    }

    let healthy = corrupted.is_empty() && scan.unreadable.is_empty();
    let details = json!({
        "scan": scan,
        "bubbles_verified": verified,
        "corrupted": corrupted,
        "dropped_for_rebuild": dropped,
    });
    if healthy {
        Ok(ExecutionOutcome::success("environment is healthy", details))
    } else if repair {
        Ok(ExecutionOutcome::success("repairs applied", details))
    } else {
        Ok(ExecutionOutcome::failure(
            "inconsistencies found (re-run with repair)",
            details,
        ))
    }
}

/// Remove bubbles, keeping the newest `keep` versions per package (or only
/// for `package` when given).
pub fn prune(ctx: &CommandContext, package: Option<&str>, keep: usize) -> ExecutionOutcome {
    match prune_inner(ctx, package, keep) {
        Ok(outcome) => outcome,
        Err(err) => fail(ctx, err),
    }
}

fn prune_inner(
    ctx: &CommandContext,
    package: Option<&str>,
    keep: usize,
) -> Result<ExecutionOutcome, CoreError> {
    let mut names: Vec<String> = Vec::new();
    if let Some(package) = package {
        names.push(vx_domain::CanonicalName::new(package).as_str().to_string());
    } else {
        for key in ctx.kb().scan(keys::BUBBLE_PREFIX)? {
            if key.ends_with(":build") {
                continue;
            }
            if let Some(rest) = key.strip_prefix(keys::BUBBLE_PREFIX) {
                if let Some((name, _)) = rest.split_once(':') {
                    if !names.contains(&name.to_string()) {
                        names.push(name.to_string());
                    }
                }
            }
        }
    }

    let mut removed: Vec<String> = Vec::new();
    let mut reclaimed = 0u64;
    for name in &names {
        let mut versions = bubble_versions(ctx.kb(), name)?;
        // Newest versions stay; version strings sort imperfectly, so order
        // by parsed version where possible.
        versions.sort_by(|a, b| {
            use std::str::FromStr;
            match (
                pep440_rs::Version::from_str(a),
                pep440_rs::Version::from_str(b),
            ) {
                (Ok(va), Ok(vb)) => va.cmp(&vb),
                _ => a.cmp(b),
            }
        });
        let cutoff = versions.len().saturating_sub(keep);
        for version in versions.into_iter().take(cutoff) {
            let Some(record) = ctx
                .kb()
                .get_json::<BubbleRecord>(&keys::bubble(name, &version))?
            else {
                continue;
            };
            reclaimed += record.size_bytes;
            drop_bubble(ctx, &record)?;
            removed.push(format!("{name}-{version}"));
        }
    }
    Ok(ExecutionOutcome::success(
        "prune complete",
        json!({ "removed": removed, "bytes_reclaimed": reclaimed }),
    ))
}

/// Discard all KB state and reconstruct it from the filesystem.
pub fn rebuild_kb(ctx: &CommandContext) -> ExecutionOutcome {
    match health::rebuild_kb(ctx.kb(), ctx.settings()) {
        Ok(report) => ExecutionOutcome::success(
            "knowledge base rebuilt",
            json!({ "packages": report.packages, "bubbles": report.bubbles }),
        ),
        Err(err) => fail(ctx, CoreError::Other(err)),
    }
}

fn drop_bubble(ctx: &CommandContext, record: &BubbleRecord) -> Result<(), CoreError> {
    if record.root_path.exists() {
        fs::remove_dir_all(&record.root_path).map_err(|err| {
            CoreError::Other(anyhow::anyhow!(
                "failed to remove {}: {err}",
                record.root_path.display()
            ))
        })?;
    }
    let record_key = keys::bubble(&record.package, &record.version);
    let versions_key = keys::pkg_versions(&record.package);
    let version = record.version.clone();
    ctx.kb().transaction(|tx| {
        tx.delete(&record_key);
        let mut versions: Vec<String> = tx.get_json(&versions_key)?.unwrap_or_default();
        versions.retain(|v| v != &version);
        tx.put_json(&versions_key, &versions)?;
        Ok(())
    })?;
    Ok(())
}
