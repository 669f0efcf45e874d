use crate::emitter::WeakEmitter;
use crate::handler::Handler;
use crate::transport::EmitResult;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

pub const HEARTBEAT_EVENT: &str = "heartbeat";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub msg: String,
    /// Seconds since the Unix epoch.
    pub time: f64,
}

impl Heartbeat {
    pub fn now() -> Self {
        Self {
            msg: HEARTBEAT_EVENT.to_string(),
            time: Utc::now().timestamp_millis() as f64 / 1000.0,
        }
    }
}

/// Answers every heartbeat with the next one after `interval`.
pub(crate) struct HeartbeatHandler {
    emitter: WeakEmitter,
    interval: Duration,
}

impl HeartbeatHandler {
    pub(crate) fn new(emitter: WeakEmitter, interval: Duration) -> Self {
        Self { emitter, interval }
    }
}

#[async_trait]
impl Handler for HeartbeatHandler {
    async fn handle(&self, message: Value) -> EmitResult<()> {
        debug!("mq received heart beat: {}", message);
        tokio::time::sleep(self.interval).await;

        match self.emitter.upgrade() {
            Some(emitter) => emitter.emit(HEARTBEAT_EVENT, &Heartbeat::now()).await,
            None => Ok(()),
        }
    }

    fn name(&self) -> &str {
        "__emit_heartbeat__"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::Emitter;

    #[test]
    fn test_heartbeat_now() {
        let before = Utc::now().timestamp() as f64;
        let heartbeat = Heartbeat::now();
        assert_eq!(heartbeat.msg, "heartbeat");
        assert!(heartbeat.time >= before);

        let value = serde_json::to_value(&heartbeat).unwrap();
        assert_eq!(value["msg"], "heartbeat");
        assert!(value["time"].is_f64());
    }

    #[tokio::test]
    async fn test_handler_waits_interval() {
        let emitter = Emitter::in_process();
        let handler = HeartbeatHandler::new(emitter.downgrade(), Duration::from_millis(50));

        let started = tokio::time::Instant::now();
        // emitter is not started, so the follow-up heartbeat is dropped
        handler.handle(serde_json::to_value(Heartbeat::now()).unwrap()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(handler.name(), "__emit_heartbeat__");
    }
}
