use crate::config::Engine;
use crate::transport::{EmitError, EmitResult, Subscription, Transport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Per-process queues, one per subscribed channel.
#[derive(Default)]
pub struct InProcessTransport {
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<Vec<u8>>>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channels(&self) -> Vec<String> {
        match self.queues.lock() {
            Ok(queues) => queues.keys().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    fn lock_err<T>(_: T) -> EmitError {
        EmitError::Closed
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> EmitResult<()> {
        let mut queues = self.queues.lock().map_err(Self::lock_err)?;

        let Some(queue) = queues.get(channel) else {
            warn!("channel {} has no listener registered, skipped.", channel);
            return Ok(());
        };

        if queue.send(payload).is_err() {
            warn!("listener of channel {} is gone, dropping its queue", channel);
            queues.remove(channel);
        }

        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> EmitResult<Subscription> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut queues = self.queues.lock().map_err(Self::lock_err)?;
        if queues.insert(channel.to_string(), sender).is_some() {
            debug!("replaced local queue of channel {}", channel);
        }
        Ok(Subscription::new(channel, receiver))
    }

    async fn close(&self) -> EmitResult<()> {
        let mut queues = self.queues.lock().map_err(Self::lock_err)?;
        debug!("closing {} local queues", queues.len());
        queues.clear();
        Ok(())
    }

    fn engine(&self) -> Engine {
        Engine::InProcess
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_listener_is_skipped() {
        let transport = InProcessTransport::new();
        tokio_test::block_on(transport.publish("/nobody", b"1".to_vec())).unwrap();
        assert!(transport.channels().is_empty());
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber_in_order() {
        let transport = InProcessTransport::new();
        let mut subscription = transport.subscribe("/echo").await.unwrap();

        transport.publish("/echo", b"1".to_vec()).await.unwrap();
        transport.publish("/echo", b"2".to_vec()).await.unwrap();
        transport.publish("/other", b"3".to_vec()).await.unwrap();

        assert_eq!(subscription.recv().await.unwrap(), b"1".to_vec());
        assert_eq!(subscription.recv().await.unwrap(), b"2".to_vec());
        assert_eq!(transport.channels(), vec!["/echo".to_string()]);
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_queue() {
        let transport = InProcessTransport::new();
        let mut first = transport.subscribe("/echo").await.unwrap();
        let mut second = transport.subscribe("/echo").await.unwrap();

        transport.publish("/echo", b"x".to_vec()).await.unwrap();
        assert!(first.recv().await.is_none());
        assert_eq!(second.recv().await.unwrap(), b"x".to_vec());
    }

    #[tokio::test]
    async fn test_dropped_subscription_unregisters_on_publish() {
        let transport = InProcessTransport::new();
        drop(transport.subscribe("/gone").await.unwrap());

        transport.publish("/gone", b"x".to_vec()).await.unwrap();
        assert!(transport.channels().is_empty());
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let transport = InProcessTransport::new();
        let mut subscription = transport.subscribe("/echo").await.unwrap();

        transport.close().await.unwrap();
        assert!(subscription.recv().await.is_none());
        assert_eq!(transport.engine(), Engine::InProcess);
    }
}
