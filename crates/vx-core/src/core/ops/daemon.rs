//! Worker daemon lifecycle operations.

use serde_json::json;

use super::fail;
use crate::core::config::context::CommandContext;
use crate::core::daemon::{WorkerRequestBody, WorkerSpec};
use crate::core::errors::CoreError;
use crate::core::tooling::outcome::ExecutionOutcome;

/// Start (or warm) the pool by pinging a baseline worker.
pub fn daemon_start(ctx: &CommandContext) -> ExecutionOutcome {
    let pool = ctx.pool();
    match pool.execute(&WorkerSpec::default(), WorkerRequestBody::Ping) {
        Ok(response) if response.ok => ExecutionOutcome::success(
            "daemon started",
            json!({ "workers": pool.worker_count() }),
        ),
        Ok(response) => ExecutionOutcome::failure(
            "daemon worker failed its warmup ping",
            json!({ "stderr": response.stderr }),
        ),
        Err(err) => fail(ctx, CoreError::Daemon(err)),
    }
}

pub fn daemon_stop(ctx: &CommandContext) -> ExecutionOutcome {
    if !ctx.pool_started() {
        return ExecutionOutcome::success("daemon was not running", json!({}));
    }
    let pool = ctx.pool();
    let workers = pool.worker_count();
    pool.shutdown();
    ExecutionOutcome::success("daemon stopped", json!({ "workers_stopped": workers }))
}

pub fn daemon_status(ctx: &CommandContext) -> ExecutionOutcome {
    if !ctx.pool_started() {
        return ExecutionOutcome::success(
            "daemon is not running",
            json!({ "running": false, "workers": [] }),
        );
    }
    let statuses = ctx.pool().status();
    ExecutionOutcome::success(
        "daemon status",
        json!({
            "running": true,
            "workers": serde_json::to_value(&statuses).unwrap_or_default(),
        }),
    )
}
