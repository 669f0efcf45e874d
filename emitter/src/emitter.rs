//! Event emitter: handler registry, per-topic listeners and engine lifecycle.
//!
//! An [`Emitter`] is a cheap, cloneable handle. Handlers are registered per
//! topic (`exchange/event`); once the emitter is started every topic gets a
//! subscription on the configured transport and a listener task that decodes
//! each message and hands it to the topic's handlers in registration order.
//!
//! # Examples
//!
//! ```rust
//! use emitter::{handler_fn, EmitError, Emitter};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let emitter = Emitter::in_process();
//! emitter
//!     .register("greeting", handler_fn("print", |msg| async move {
//!         println!("got {}", msg);
//!         Ok::<(), EmitError>(())
//!     }))
//!     .await?;
//!
//! emitter.start().await?;
//! emitter.emit("greeting", &json!({"msg": "hello"})).await?;
//! emitter.stop().await;
//! # Ok(())
//! # }
//! ```

use crate::codec::{self, DEFAULT_EXCHANGE};
use crate::config::{EmitConfig, Engine};
use crate::handler::{Handler, HandlerId};
use crate::heartbeat::{Heartbeat, HeartbeatHandler, HEARTBEAT_EVENT};
use crate::in_process::InProcessTransport;
use crate::rpc::{RpcClientHandler, RpcServerHandler, RpcState, RPC_CLIENT_CHANNEL, RPC_SERVER_CHANNEL};
use crate::transport::{EmitError, EmitResult, Subscription, Transport};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct Binding {
    handlers: Vec<(HandlerId, Arc<dyn Handler>)>,
    bound: bool,
    listener: Option<JoinHandle<()>>,
}

pub(crate) struct Inner {
    config: EmitConfig,
    registry: Mutex<HashMap<String, Binding>>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    started: AtomicBool,
    next_id: AtomicU64,
    lifecycle: tokio::sync::Mutex<()>,
    pub(crate) rpc: RpcState,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, HashMap<String, Binding>> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handlers_of(&self, topic: &str) -> Vec<Arc<dyn Handler>> {
        self.registry()
            .get(topic)
            .map(|binding| binding.handlers.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }
}

/// Handle to a running or stopped event emitter.
#[derive(Clone)]
pub struct Emitter {
    pub(crate) inner: Arc<Inner>,
}

/// Non-owning handle used by handlers the emitter installs on itself.
#[derive(Clone)]
pub(crate) struct WeakEmitter(Weak<Inner>);

impl WeakEmitter {
    pub(crate) fn upgrade(&self) -> Option<Emitter> {
        self.0.upgrade().map(|inner| Emitter { inner })
    }
}

impl Emitter {
    pub fn new(config: EmitConfig) -> EmitResult<Self> {
        config
            .validate()
            .map_err(|message| EmitError::InvalidConfig { message })?;

        Ok(Self::from_config(config))
    }

    pub fn in_process() -> Self {
        Self::from_config(EmitConfig::default())
    }

    fn from_config(config: EmitConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry: Mutex::new(HashMap::new()),
                transport: Mutex::new(None),
                started: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                lifecycle: tokio::sync::Mutex::new(()),
                rpc: RpcState::default(),
            }),
        }
    }

    pub fn config(&self) -> &EmitConfig {
        &self.inner.config
    }

    pub fn engine(&self) -> Engine {
        self.inner.config.engine
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Registered topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.inner.registry().keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.handler_count_in(DEFAULT_EXCHANGE, event)
    }

    pub fn handler_count_in(&self, exchange: &str, event: &str) -> usize {
        self.inner
            .registry()
            .get(&codec::topic(exchange, event))
            .map_or(0, |binding| binding.handlers.len())
    }

    pub(crate) fn downgrade(&self) -> WeakEmitter {
        WeakEmitter(Arc::downgrade(&self.inner))
    }

    fn add_handler(&self, topic: &str, handler: Arc<dyn Handler>) -> HandlerId {
        let id = HandlerId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        self.inner
            .registry()
            .entry(topic.to_string())
            .or_default()
            .handlers
            .push((id, handler));
        id
    }

    /// Adds `handler` unless a handler of the same name already serves `topic`.
    fn ensure_handler(&self, topic: &str, handler: Arc<dyn Handler>) {
        let present = self
            .inner
            .registry()
            .get(topic)
            .is_some_and(|binding| binding.handlers.iter().any(|(_, h)| h.name() == handler.name()));
        if !present {
            self.add_handler(topic, handler);
        }
    }

    /// Records `handler` for `event` without waiting for the topic to be bound.
    ///
    /// When the emitter is already running the binding happens on a spawned task.
    pub fn on<H: Handler + 'static>(&self, event: &str, handler: H) -> HandlerId {
        self.on_in(DEFAULT_EXCHANGE, event, handler)
    }

    pub fn on_in<H: Handler + 'static>(&self, exchange: &str, event: &str, handler: H) -> HandlerId {
        let topic = codec::topic(exchange, event);
        let id = self.add_handler(&topic, Arc::new(handler));

        if self.is_started() {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let emitter = self.clone();
                    runtime.spawn(async move {
                        if let Err(e) = emitter.bind(&topic).await {
                            warn!("failed to bind {}: {}", topic, e);
                        }
                    });
                }
                Err(_) => warn!("no async runtime available, {} stays unbound until next start", topic),
            }
        }

        id
    }

    pub async fn register<H: Handler + 'static>(&self, event: &str, handler: H) -> EmitResult<HandlerId> {
        self.register_in(DEFAULT_EXCHANGE, event, handler).await
    }

    pub async fn register_in<H: Handler + 'static>(
        &self,
        exchange: &str,
        event: &str,
        handler: H,
    ) -> EmitResult<HandlerId> {
        let topic = codec::topic(exchange, event);
        let id = self.add_handler(&topic, Arc::new(handler));

        if self.is_started() {
            self.bind(&topic).await?;
        }

        Ok(id)
    }

    pub fn unsubscribe(&self, event: &str, id: HandlerId) -> bool {
        self.unsubscribe_in(DEFAULT_EXCHANGE, event, id)
    }

    pub fn unsubscribe_in(&self, exchange: &str, event: &str, id: HandlerId) -> bool {
        let topic = codec::topic(exchange, event);
        let mut registry = self.inner.registry();

        let Some(binding) = registry.get_mut(&topic) else {
            warn!("{} is not registered", topic);
            return false;
        };

        let before = binding.handlers.len();
        binding.handlers.retain(|(handler_id, _)| *handler_id != id);
        if binding.handlers.len() == before {
            warn!("{} is not registered as handler of {}", id, topic);
            return false;
        }

        true
    }

    fn transport(&self) -> EmitResult<Arc<dyn Transport>> {
        self.inner
            .transport
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(EmitError::NotStarted)
    }

    async fn bind(&self, topic: &str) -> EmitResult<()> {
        let transport = self.transport()?;

        {
            let mut registry = self.inner.registry();
            let binding = registry.entry(topic.to_string()).or_default();
            if binding.bound {
                debug!("msg {} is already bound to {} queue, skipped", topic, transport.engine());
                return Ok(());
            }
            binding.bound = true;
        }

        let subscription = match transport.subscribe(topic).await {
            Ok(subscription) => subscription,
            Err(e) => {
                if let Some(binding) = self.inner.registry().get_mut(topic) {
                    binding.bound = false;
                }
                return Err(e);
            }
        };

        let task = tokio::spawn(listen(self.downgrade(), subscription));
        if let Some(binding) = self.inner.registry().get_mut(topic) {
            if let Some(previous) = binding.listener.replace(task) {
                previous.abort();
            }
        }

        info!("listening on {} ({})", topic, transport.engine());
        Ok(())
    }

    async fn connect(&self) -> EmitResult<Arc<dyn Transport>> {
        match self.inner.config.engine {
            Engine::InProcess => Ok(Arc::new(InProcessTransport::new())),
            Engine::Redis => {
                let dsn = self.inner.config.dsn.as_deref().ok_or_else(|| EmitError::InvalidConfig {
                    message: "When engine is redis, dsn is required".to_string(),
                })?;
                connect_redis(dsn, &self.inner.config).await
            }
        }
    }

    pub async fn start(&self) -> EmitResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        if self.is_started() {
            info!("emit is already started.");
            return Ok(());
        }

        let config = &self.inner.config;
        info!("starting emit ({}) with topics: {:?}", config.engine, self.topics());

        let transport = self.connect().await?;
        *self
            .inner
            .transport
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(transport.clone());

        let client_topic = codec::topic(DEFAULT_EXCHANGE, RPC_CLIENT_CHANNEL);
        self.ensure_handler(&client_topic, Arc::new(RpcClientHandler::new(self.downgrade())));

        if config.engine == Engine::InProcess || config.start_server {
            let server_topic = codec::topic(DEFAULT_EXCHANGE, RPC_SERVER_CHANNEL);
            self.ensure_handler(&server_topic, Arc::new(RpcServerHandler::new(self.downgrade())));
        }

        let heartbeat = config.engine == Engine::Redis && config.heartbeat_enabled();
        if heartbeat {
            let heartbeat_topic = codec::topic(DEFAULT_EXCHANGE, HEARTBEAT_EVENT);
            self.ensure_handler(
                &heartbeat_topic,
                Arc::new(HeartbeatHandler::new(self.downgrade(), config.heartbeat)),
            );
        }

        for topic in self.topics() {
            if let Err(e) = self.bind(&topic).await {
                error!("failed to bind {}: {}", topic, e);
                self.teardown(transport).await;
                return Err(e);
            }
        }

        self.inner.started.store(true, Ordering::SeqCst);

        if heartbeat {
            if let Err(e) = self.emit(HEARTBEAT_EVENT, &Heartbeat::now()).await {
                error!("failed to send first heart beat: {}", e);
                self.inner.started.store(false, Ordering::SeqCst);
                self.teardown(transport).await;
                return Err(e);
            }
        }

        Ok(())
    }

    /// Unbinds every topic and closes the transport. Topics stay known but lose their handlers.
    pub async fn stop(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        info!("stopping emit...");

        self.inner.started.store(false, Ordering::SeqCst);
        let transport = self
            .inner
            .transport
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(transport) = transport {
            self.teardown(transport).await;
        }
        for binding in self.inner.registry().values_mut() {
            binding.handlers.clear();
        }

        info!("emit stopped.");
    }

    async fn teardown(&self, transport: Arc<dyn Transport>) {
        if let Err(e) = transport.close().await {
            warn!("failed to close {} transport: {}", transport.engine(), e);
        }

        self.inner
            .transport
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        for binding in self.inner.registry().values_mut() {
            if let Some(listener) = binding.listener.take() {
                listener.abort();
            }
            binding.bound = false;
        }

        self.inner.rpc.cancel_pending();
    }

    pub async fn emit<T: Serialize + ?Sized>(&self, event: &str, message: &T) -> EmitResult<()> {
        self.emit_in(DEFAULT_EXCHANGE, event, message).await
    }

    /// Publishes `message` on `exchange/event`.
    ///
    /// Emitting before [`Emitter::start`] (or after [`Emitter::stop`]) is logged and ignored.
    pub async fn emit_in<T: Serialize + ?Sized>(&self, exchange: &str, event: &str, message: &T) -> EmitResult<()> {
        if !self.is_started() {
            warn!("emit is stopped or not started yet.");
            return Ok(());
        }

        let topic = codec::topic(exchange, event);
        let payload = codec::encode(message)?;
        debug!("send message on channel {}: {} bytes", topic, payload.len());

        self.transport()?.publish(&topic, payload).await
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(dsn: &str, config: &EmitConfig) -> EmitResult<Arc<dyn Transport>> {
    let transport = crate::redis_transport::RedisTransport::connect(dsn, config.reconnect_delay).await?;
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(_dsn: &str, _config: &EmitConfig) -> EmitResult<Arc<dyn Transport>> {
    Err(EmitError::InvalidConfig {
        message: "redis engine requires the `redis` feature".to_string(),
    })
}

async fn dispatch(topic: &str, handlers: Vec<Arc<dyn Handler>>, message: Value) {
    for handler in handlers {
        debug!("{} is handling message on {}", handler.name(), topic);
        match AssertUnwindSafe(handler.handle(message.clone())).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("msg {} caused exception in {}: {}", message, handler.name(), e),
            Err(_) => error!("handler {} panicked on msg {}", handler.name(), message),
        }
    }
}

async fn listen(weak: WeakEmitter, mut subscription: Subscription) {
    let topic = subscription.channel().to_string();

    while let Some(payload) = subscription.recv().await {
        let Some(emitter) = weak.upgrade() else {
            break;
        };

        let message = match codec::decode(&payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("msg on {} could not be decoded: {}", topic, e);
                continue;
            }
        };
        debug!("emit received msg on {}: {}", topic, message);

        // handlers may be added after binding, so look them up per message
        let handlers = emitter.inner.handlers_of(&topic);
        drop(emitter);

        if handlers.is_empty() {
            debug!("discarded msg due to no handlers attached: {}", message);
            continue;
        }

        dispatch(&topic, handlers, message).await;
    }

    debug!("listener of {} stopped", topic);
}
