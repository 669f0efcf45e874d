use crate::config::Engine;
use crate::transport::{EmitError, EmitResult, Subscription, Transport};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::{AsyncCommands, Client};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Redis pub/sub engine: one shared publisher, one pub/sub connection per channel.
pub struct RedisTransport {
    client: Client,
    publisher: Mutex<Option<ConnectionManager>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    reconnect_delay: Duration,
}

impl RedisTransport {
    pub async fn connect(dsn: &str, reconnect_delay: Duration) -> EmitResult<Self> {
        let client = Client::open(dsn)?;
        let publisher = ConnectionManager::new(client.clone()).await?;

        info!("Redis transport connected");

        Ok(Self {
            client,
            publisher: Mutex::new(Some(publisher)),
            listeners: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            reconnect_delay,
        })
    }

    fn publisher(&self) -> EmitResult<ConnectionManager> {
        let guard = self.publisher.lock().map_err(|_| EmitError::Closed)?;
        guard.clone().ok_or(EmitError::Closed)
    }
}

async fn open_pubsub(client: &Client, channel: &str) -> redis::RedisResult<PubSub> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    debug!("subscribed to redis channel {}", channel);
    Ok(pubsub)
}

/// Forwards payloads until the stream ends. Returns false once the receiving side is gone.
async fn forward(pubsub: PubSub, sender: &mpsc::UnboundedSender<Vec<u8>>) -> bool {
    let mut messages = Box::pin(pubsub.into_on_message());
    loop {
        tokio::select! {
            _ = sender.closed() => return false,
            message = messages.next() => match message {
                Some(message) => {
                    if sender.send(message.get_payload_bytes().to_vec()).is_err() {
                        return false;
                    }
                }
                None => return true,
            },
        }
    }
}

/// Drives an already subscribed `pubsub`, reconnecting and resubscribing
/// when the server drops the connection.
async fn pump(
    client: Client,
    channel: String,
    mut pubsub: PubSub,
    sender: mpsc::UnboundedSender<Vec<u8>>,
    reconnect_delay: Duration,
) {
    loop {
        if !forward(pubsub, &sender).await {
            return;
        }
        warn!("connection with Redis server closed on {}, retry connect", channel);

        pubsub = loop {
            tokio::select! {
                _ = sender.closed() => return,
                _ = tokio::time::sleep(reconnect_delay) => {}
            }

            match open_pubsub(&client, &channel).await {
                Ok(pubsub) => break pubsub,
                Err(e) => warn!("failed to resubscribe to {}: {}", channel, e),
            }
        };
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> EmitResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EmitError::Closed);
        }

        let mut conn = self.publisher()?;
        conn.publish::<_, _, ()>(channel, payload).await.map_err(|e| {
            warn!("publish on {} failed: {}", channel, e);
            EmitError::Redis(e)
        })
    }

    async fn subscribe(&self, channel: &str) -> EmitResult<Subscription> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EmitError::Closed);
        }

        let pubsub = open_pubsub(&self.client, channel).await?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(EmitError::Closed);
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(pump(
            self.client.clone(),
            channel.to_string(),
            pubsub,
            sender,
            self.reconnect_delay,
        ));

        let mut listeners = self.listeners.lock().map_err(|_| EmitError::Closed)?;
        listeners.retain(|handle| !handle.is_finished());
        listeners.push(task);

        Ok(Subscription::new(channel, receiver))
    }

    async fn close(&self) -> EmitResult<()> {
        self.closed.store(true, Ordering::SeqCst);

        if let Ok(mut listeners) = self.listeners.lock() {
            for handle in listeners.drain(..) {
                handle.abort();
            }
        }

        if let Ok(mut publisher) = self.publisher.lock() {
            publisher.take();
        }

        info!("Redis transport closed");
        Ok(())
    }

    fn engine(&self) -> Engine {
        Engine::Redis
    }
}
