use crate::transport::EmitResult;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::future::Future;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub(crate) u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler#{}", self.0)
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, message: Value) -> EmitResult<()>;

    fn name(&self) -> &str {
        "handler"
    }
}

pub struct FnHandler<F> {
    name: String,
    func: F,
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = EmitResult<()>> + Send + 'static,
{
    async fn handle(&self, message: Value) -> EmitResult<()> {
        (self.func)(message).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Wraps an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(name: impl Into<String>, func: F) -> FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = EmitResult<()>> + Send + 'static,
{
    FnHandler {
        name: name.into(),
        func,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::EmitError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_handler_fn() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handler = handler_fn("count", move |message: Value| {
            let counter = counter.clone();
            async move {
                if message.is_null() {
                    return Err(EmitError::handler("empty message"));
                }
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        assert_eq!(handler.name(), "count");
        handler.handle(json!({"msg": 1})).await.unwrap();
        assert!(handler.handle(Value::Null).await.is_err());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_id_display() {
        assert_eq!(HandlerId(7).to_string(), "handler#7");
    }
}
