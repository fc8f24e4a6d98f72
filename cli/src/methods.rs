//! Demonstration methods served by `wsrpc-cli receive`.

use std::time::Duration;

use serde_json::{Value, json};
use wsrpc::{Arguments, CallContext, MethodError, MethodRegistry, MethodResult, ReceiverError, RegistryError, arg};

/// Registry holding every demo method.
pub fn registry() -> Result<MethodRegistry, RegistryError> {
    let registry = MethodRegistry::new();
    registry
        .register("math_add", math_add)?
        .register("sleep", sleep)?
        .register("echo", echo)?
        .register("fail", fail)?;
    Ok(registry)
}

/// `integer1 + integer2`.
async fn math_add(args: Arguments, _ctx: CallContext) -> MethodResult {
    let a: i64 = arg(&args, "integer1")?;
    let b: i64 = arg(&args, "integer2")?;
    a.checked_add(b)
        .map(|sum| json!(sum))
        .ok_or_else(|| MethodError::failed("integer overflow"))
}

/// Sleep `seconds`, returning them; `-1` when canceled first.
async fn sleep(args: Arguments, ctx: CallContext) -> MethodResult {
    let seconds: f64 = arg(&args, "seconds")?;
    let duration = Duration::try_from_secs_f64(seconds).map_err(|e| MethodError::InvalidArgument {
        name: "seconds".into(),
        reason: e.to_string(),
    })?;
    tokio::select! {
        () = tokio::time::sleep(duration) => Ok(json!(seconds)),
        () = ctx.cancelled() => Ok(json!(-1)),
    }
}

/// Return the arguments unchanged.
async fn echo(args: Arguments, _ctx: CallContext) -> MethodResult {
    Ok(Value::Object(args))
}

/// Always fails with `message`.
async fn fail(args: Arguments, _ctx: CallContext) -> MethodResult {
    let message: String = arg(&args, "message").unwrap_or_else(|_| "failure requested".to_owned());
    Err(ReceiverError::new(message).into())
}

#[cfg(test)]
#[path = "methods_test.rs"]
mod tests;
