use async_trait::async_trait;
use emitter::{EmitError, EmitResult, Emitter, RpcMethod};
use serde_json::{json, Value};

/// RPC methods exposed by `emitctl serve`.
pub const BUILTIN_METHODS: [&str; 3] = ["echo", "ping", "calculate"];

pub fn register_builtins(emitter: &Emitter) {
    emitter.rpc_register("echo", EchoMethod);
    emitter.rpc_register("ping", PingMethod);
    emitter.rpc_register("calculate", CalculateMethod);
}

fn invalid(message: impl Into<String>) -> EmitError {
    EmitError::handler(message)
}

pub struct EchoMethod;

#[async_trait]
impl RpcMethod for EchoMethod {
    async fn call(&self, params: Value) -> EmitResult<Value> {
        Ok(json!({
            "echoed": params,
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))
    }
}

pub struct PingMethod;

#[async_trait]
impl RpcMethod for PingMethod {
    async fn call(&self, _params: Value) -> EmitResult<Value> {
        Ok(json!({ "pong": true }))
    }
}

pub struct CalculateMethod;

#[async_trait]
impl RpcMethod for CalculateMethod {
    async fn call(&self, params: Value) -> EmitResult<Value> {
        let operation = params
            .get("operation")
            .and_then(|v| v.as_str())
            .ok_or_else(|| invalid("Missing or invalid 'operation' parameter"))?;

        let a = params
            .get("a")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| invalid("Missing or invalid 'a' parameter"))?;

        let b = params
            .get("b")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| invalid("Missing or invalid 'b' parameter"))?;

        let result = match operation {
            "add" => a + b,
            "subtract" => a - b,
            "multiply" => a * b,
            "divide" => {
                if b == 0.0 {
                    return Err(invalid("Division by zero"));
                }
                a / b
            }
            _ => return Err(invalid(format!("Unknown operation: {}", operation))),
        };

        Ok(json!({
            "operation": operation,
            "operands": [a, b],
            "result": result
        }))
    }
}
