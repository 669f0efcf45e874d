pub mod codec;
pub mod config;
pub mod emitter;
pub mod handler;
pub mod heartbeat;
pub mod in_process;
pub mod rpc;
pub mod transport;

#[cfg(feature = "redis")]
pub mod redis_transport;

pub use codec::{topic, DEFAULT_EXCHANGE};
pub use config::{EmitConfig, Engine};
pub use emitter::Emitter;
pub use handler::{handler_fn, FnHandler, Handler, HandlerId};
pub use heartbeat::{Heartbeat, HEARTBEAT_EVENT};
pub use in_process::InProcessTransport;
pub use rpc::{rpc_fn, FnMethod, RpcMethod, RpcRequest, RpcResponse, RPC_CLIENT_CHANNEL, RPC_SERVER_CHANNEL};
pub use transport::{EmitError, EmitResult, Subscription, Transport};

#[cfg(feature = "redis")]
pub use redis_transport::RedisTransport;

pub mod prelude {
    pub use crate::codec::*;
    pub use crate::config::*;
    pub use crate::emitter::*;
    pub use crate::handler::*;
    pub use crate::heartbeat::*;
    pub use crate::rpc::*;
    pub use crate::transport::*;

    #[cfg(feature = "redis")]
    pub use crate::redis_transport::*;
}
