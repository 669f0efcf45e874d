use crate::config::Engine;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum EmitError {
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Emitter is not started")]
    NotStarted,

    #[error("Transport closed")]
    Closed,

    #[error("RPC call {sn} timed out after {timeout:?}")]
    RpcTimeout { sn: String, timeout: Duration },

    #[error("RPC call failed: {message}")]
    Rpc { message: String },

    #[error("RPC call cancelled")]
    Cancelled,

    #[error("Handler failed: {message}")]
    Handler { message: String },
}

impl EmitError {
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }
}

pub type EmitResult<T> = Result<T, EmitError>;

/// Raw payloads delivered for one subscribed channel.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    receiver: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, receiver: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            channel: channel.into(),
            receiver,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Waits for the next payload. `None` once the transport side is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.receiver.recv().await
    }
}

/// Message delivery backend used by the emitter.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> EmitResult<()>;

    async fn subscribe(&self, channel: &str) -> EmitResult<Subscription>;

    async fn close(&self) -> EmitResult<()>;

    fn engine(&self) -> Engine;
}
