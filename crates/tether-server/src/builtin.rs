//! Operations the server answers on its own, under `system/server/*`.

use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tether_core::errors::OPERATION_FAILED;
use tether_core::{OperationContext, OperationError, OperationResult, StaticRegistry, Target};

pub const INVALID_PAYLOAD: &str = "INVALID_PAYLOAD";

const OWNER: &str = "system";
const ENTITY: &str = "server";
const MAX_SLEEP_MS: u64 = 3_600_000;

fn target(action: &str) -> Target {
    Target::new(OWNER, ENTITY, action)
}

/// Registry holding the built-in operations.
pub fn builtin_registry() -> StaticRegistry {
    let mut registry = StaticRegistry::new();
    registry.register_fn(target("ping"), ping);
    registry.register_fn(target("echo"), echo);
    registry.register_fn(target("sleep"), sleep);
    registry.register_fn(target("countdown"), countdown);
    registry.register_fn(target("fail"), fail);
    registry
}

fn args<T: for<'de> Deserialize<'de>>(payload: &Value) -> Result<T, OperationError> {
    // A bare `null` payload means "all defaults".
    let payload = if payload.is_null() { json!({}) } else { payload.clone() };
    serde_json::from_value(payload)
        .map_err(|e| OperationError::structured(INVALID_PAYLOAD, e.to_string()))
}

async fn ping(ctx: OperationContext) -> OperationResult {
    Ok(json!({
        "pong": true,
        "session_id": ctx.session_id.as_str(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn echo(ctx: OperationContext) -> OperationResult {
    Ok(ctx.payload)
}

#[derive(Debug, Deserialize)]
struct SleepArgs {
    #[serde(default)]
    ms: u64,
}

/// Wait `ms` milliseconds unless cancelled first.
async fn sleep(ctx: OperationContext) -> OperationResult {
    let SleepArgs { ms } = args(&ctx.payload)?;
    let ms = ms.min(MAX_SLEEP_MS);
    tokio::select! {
        () = ctx.cancel.cancelled() => Err(OperationError::Cancelled),
        () = tokio::time::sleep(Duration::from_millis(ms)) => Ok(json!({ "slept_ms": ms })),
    }
}

#[derive(Debug, Deserialize)]
struct CountdownArgs {
    #[serde(default = "default_from")]
    from: u32,
    #[serde(default = "default_interval_ms")]
    interval_ms: u64,
}

fn default_from() -> u32 {
    3
}

fn default_interval_ms() -> u64 {
    100
}

/// Emit one `notify` per step, then succeed.
async fn countdown(ctx: OperationContext) -> OperationResult {
    let CountdownArgs { from, interval_ms } = args(&ctx.payload)?;
    let interval = Duration::from_millis(interval_ms.min(MAX_SLEEP_MS));

    for remaining in (1..=from).rev() {
        ctx.checkpoint()?;
        ctx.notifier.notify(json!({ "remaining": remaining })).await;
        tokio::select! {
            () = ctx.cancel.cancelled() => return Err(OperationError::Cancelled),
            () = tokio::time::sleep(interval) => {}
        }
    }
    Ok(json!({ "done": true, "steps": from }))
}

#[derive(Debug, Deserialize)]
struct FailArgs {
    code: Option<String>,
    message: Option<String>,
}

/// Always fails with a structured error.
async fn fail(ctx: OperationContext) -> OperationResult {
    let FailArgs { code, message } = args(&ctx.payload)?;
    Err(OperationError::structured(
        code.unwrap_or_else(|| OPERATION_FAILED.to_string()),
        message.unwrap_or_else(|| "requested failure".to_string()),
    ))
}
