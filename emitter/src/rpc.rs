//! Request/response calls layered on two well-known emitter channels.
//!
//! A client publishes an [`RpcRequest`] on the server channel and waits for the
//! [`RpcResponse`] carrying the same serial number (`sn`) on the client
//! channel. Servers dispatch requests to methods registered with
//! [`Emitter::rpc_register`].

use crate::emitter::{Emitter, WeakEmitter};
use crate::handler::Handler;
use crate::transport::{EmitError, EmitResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

pub const RPC_CLIENT_CHANNEL: &str = "__emit_rpc_client_channel__";
pub const RPC_SERVER_CHANNEL: &str = "__emit_rpc_server_channel__";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub sn: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            sn: Uuid::new_v4().to_string(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub sn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn ok(sn: impl Into<String>, result: Value) -> Self {
        Self {
            sn: sn.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn err(sn: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            sn: sn.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn into_result(self) -> EmitResult<Value> {
        match self.error {
            Some(message) => Err(EmitError::Rpc { message }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[async_trait]
pub trait RpcMethod: Send + Sync {
    async fn call(&self, params: Value) -> EmitResult<Value>;
}

pub struct FnMethod<F> {
    func: F,
}

#[async_trait]
impl<F, Fut> RpcMethod for FnMethod<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = EmitResult<Value>> + Send + 'static,
{
    async fn call(&self, params: Value) -> EmitResult<Value> {
        (self.func)(params).await
    }
}

pub fn rpc_fn<F, Fut>(func: F) -> FnMethod<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = EmitResult<Value>> + Send + 'static,
{
    FnMethod { func }
}

#[derive(Default)]
pub(crate) struct RpcState {
    pending: Mutex<HashMap<String, oneshot::Sender<RpcResponse>>>,
    methods: Mutex<HashMap<String, Arc<dyn RpcMethod>>>,
}

impl RpcState {
    fn pending(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<RpcResponse>>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn methods(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn RpcMethod>>> {
        self.methods.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Drops every waiting caller; their calls resolve to [`EmitError::Cancelled`].
    pub(crate) fn cancel_pending(&self) {
        let cancelled = self.pending().drain().count();
        if cancelled > 0 {
            debug!("cancelled {} pending rpc calls", cancelled);
        }
    }
}

impl Emitter {
    pub fn rpc_register<M: RpcMethod + 'static>(&self, method: impl Into<String>, handler: M) {
        let method = method.into();
        if self.inner.rpc.methods().insert(method.clone(), Arc::new(handler)).is_some() {
            warn!("rpc method {} was already registered, replaced", method);
        }
    }

    pub fn rpc_unregister(&self, method: &str) -> bool {
        self.inner.rpc.methods().remove(method).is_some()
    }

    pub fn rpc_methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.inner.rpc.methods().keys().cloned().collect();
        methods.sort();
        methods
    }

    pub fn rpc_pending(&self) -> usize {
        self.inner.rpc.pending_count()
    }

    pub async fn rpc_send<P: Serialize + ?Sized>(&self, method: &str, params: &P) -> EmitResult<Value> {
        self.rpc_send_with_timeout(method, params, self.config().rpc_timeout)
            .await
    }

    pub async fn rpc_send_with_timeout<P: Serialize + ?Sized>(
        &self,
        method: &str,
        params: &P,
        timeout: Duration,
    ) -> EmitResult<Value> {
        if !self.is_started() {
            return Err(EmitError::NotStarted);
        }

        let request = RpcRequest::new(method, serde_json::to_value(params)?);
        let sn = request.sn.clone();
        let (sender, receiver) = oneshot::channel();
        self.inner.rpc.pending().insert(sn.clone(), sender);

        debug!("sending rpc msg to server: {}", sn);
        if let Err(e) = self.emit(RPC_SERVER_CHANNEL, &request).await {
            self.inner.rpc.pending().remove(&sn);
            return Err(e);
        }

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(_)) => Err(EmitError::Cancelled),
            Err(_) => {
                self.inner.rpc.pending().remove(&sn);
                Err(EmitError::RpcTimeout { sn, timeout })
            }
        }
    }

    pub async fn rpc_respond(&self, response: &RpcResponse) -> EmitResult<()> {
        debug!("responding rpc msg to client: {}", response.sn);
        self.emit(RPC_CLIENT_CHANNEL, response).await
    }

    async fn rpc_serve(&self, request: RpcRequest) -> EmitResult<()> {
        let method = self.inner.rpc.methods().get(&request.method).cloned();

        let response = match method {
            Some(method) => match method.call(request.params).await {
                Ok(result) => RpcResponse::ok(&request.sn, result),
                Err(e) => RpcResponse::err(&request.sn, e.to_string()),
            },
            None => {
                warn!("received call of unknown rpc method {}", request.method);
                RpcResponse::err(&request.sn, format!("unknown rpc method: {}", request.method))
            }
        };

        self.rpc_respond(&response).await
    }
}

pub(crate) struct RpcClientHandler {
    emitter: WeakEmitter,
}

impl RpcClientHandler {
    pub(crate) fn new(emitter: WeakEmitter) -> Self {
        Self { emitter }
    }
}

#[async_trait]
impl Handler for RpcClientHandler {
    async fn handle(&self, message: Value) -> EmitResult<()> {
        let Some(sn) = message.get("sn").and_then(Value::as_str).map(str::to_string) else {
            warn!("rpc call msg must contain sn key: {}", message);
            return Ok(());
        };

        let Some(emitter) = self.emitter.upgrade() else {
            return Ok(());
        };

        let waiting = emitter.inner.rpc.pending().remove(&sn);
        match waiting {
            Some(waiting) => {
                let response: RpcResponse = serde_json::from_value(message)?;
                if waiting.send(response).is_err() {
                    debug!("rpc caller of {} went away before the response arrived", sn);
                }
            }
            None => debug!("emit received unsolicited message: {}", sn),
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "__emit_rpc_client__"
    }
}

pub(crate) struct RpcServerHandler {
    emitter: WeakEmitter,
}

impl RpcServerHandler {
    pub(crate) fn new(emitter: WeakEmitter) -> Self {
        Self { emitter }
    }
}

#[async_trait]
impl Handler for RpcServerHandler {
    async fn handle(&self, message: Value) -> EmitResult<()> {
        let request: RpcRequest = serde_json::from_value(message)?;

        let Some(emitter) = self.emitter.upgrade() else {
            return Ok(());
        };

        // run the method off the listener so a method may itself call rpc_send
        tokio::spawn(async move {
            let sn = request.sn.clone();
            if let Err(e) = emitter.rpc_serve(request).await {
                warn!("failed to serve rpc call {}: {}", sn, e);
            }
        });

        Ok(())
    }

    fn name(&self) -> &str {
        "__emit_rpc_server__"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let request = RpcRequest::new("add", json!({"count": 0}));
        assert_eq!(request.sn.len(), 36);

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["method"], "add");
        assert_eq!(value["params"]["count"], 0);

        let parsed: RpcRequest = serde_json::from_value(json!({"sn": "1", "method": "ping"})).unwrap();
        assert_eq!(parsed.params, Value::Null);
    }

    #[test]
    fn test_response_into_result() {
        assert_eq!(
            RpcResponse::ok("1", json!({"result": 1})).into_result().unwrap(),
            json!({"result": 1})
        );

        let err = RpcResponse::err("1", "unknown rpc method: nope").into_result();
        assert!(matches!(err, Err(EmitError::Rpc { message }) if message == "unknown rpc method: nope"));

        let bare: RpcResponse = serde_json::from_value(json!({"sn": "1"})).unwrap();
        assert_eq!(bare.into_result().unwrap(), Value::Null);

        let encoded = serde_json::to_value(RpcResponse::ok("1", json!(2))).unwrap();
        assert!(encoded.get("error").is_none());
    }

    #[tokio::test]
    async fn test_rpc_fn() {
        let method = rpc_fn(|params: Value| async move {
            let count = params["count"].as_i64().unwrap_or_default();
            Ok::<Value, EmitError>(json!({"result": count + 1}))
        });

        assert_eq!(method.call(json!({"count": 4})).await.unwrap()["result"], 5);
    }

    #[tokio::test]
    async fn test_rpc_send_requires_start() {
        let emitter = Emitter::in_process();
        assert!(matches!(
            emitter.rpc_send("add", &json!({})).await,
            Err(EmitError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_client_handler_ignores_unknown_and_malformed() {
        let emitter = Emitter::in_process();
        let handler = RpcClientHandler::new(emitter.downgrade());

        handler.handle(json!({"result": 1})).await.unwrap();
        handler.handle(json!({"sn": "unknown", "result": 1})).await.unwrap();
        assert_eq!(emitter.rpc_pending(), 0);
    }

    #[tokio::test]
    async fn test_client_handler_completes_pending_call() {
        let emitter = Emitter::in_process();
        let handler = RpcClientHandler::new(emitter.downgrade());

        let (sender, receiver) = oneshot::channel();
        emitter.inner.rpc.pending().insert("abc".to_string(), sender);

        handler.handle(json!({"sn": "abc", "result": 7})).await.unwrap();
        assert_eq!(receiver.await.unwrap().into_result().unwrap(), json!(7));
        assert_eq!(emitter.rpc_pending(), 0);
    }

    #[test]
    fn test_cancel_pending() {
        let state = RpcState::default();
        let (sender, mut receiver) = oneshot::channel();
        state.pending().insert("a".to_string(), sender);

        state.cancel_pending();
        assert_eq!(state.pending_count(), 0);
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_method_table() {
        let emitter = Emitter::in_process();
        emitter.rpc_register("b", rpc_fn(|_| async { Ok::<Value, EmitError>(Value::Null) }));
        emitter.rpc_register("a", rpc_fn(|_| async { Ok::<Value, EmitError>(Value::Null) }));
        assert_eq!(emitter.rpc_methods(), vec!["a".to_string(), "b".to_string()]);

        assert!(emitter.rpc_unregister("a"));
        assert!(!emitter.rpc_unregister("a"));
    }
}
