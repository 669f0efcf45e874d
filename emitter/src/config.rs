use crate::transport::{EmitError, EmitResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_ENGINE: &str = "EMIT_ENGINE";
pub const ENV_DSN: &str = "EMIT_DSN";
pub const ENV_HEARTBEAT_SECS: &str = "EMIT_HEARTBEAT_SECS";
pub const ENV_START_SERVER: &str = "EMIT_START_SERVER";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    #[default]
    InProcess = 0,
    Redis = 1,
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Engine::InProcess => write!(f, "in_process"),
            Engine::Redis => write!(f, "redis"),
        }
    }
}

impl FromStr for Engine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in_process" | "in-process" | "inprocess" | "0" => Ok(Engine::InProcess),
            "redis" | "1" => Ok(Engine::Redis),
            other => Err(format!("Unknown engine: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitConfig {
    pub engine: Engine,
    pub dsn: Option<String>,
    #[serde(with = "duration_secs")]
    pub heartbeat: Duration,
    pub start_server: bool,
    #[serde(with = "duration_secs")]
    pub rpc_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub reconnect_delay: Duration,
}

impl Default for EmitConfig {
    fn default() -> Self {
        Self {
            engine: Engine::InProcess,
            dsn: None,
            heartbeat: Duration::ZERO,
            start_server: false,
            rpc_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

impl EmitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn redis(dsn: impl Into<String>) -> Self {
        Self::default().with_engine(Engine::Redis).with_dsn(dsn)
    }

    pub fn with_engine(mut self, engine: Engine) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_dsn(mut self, dsn: impl Into<String>) -> Self {
        self.dsn = Some(dsn.into());
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_start_server(mut self, start_server: bool) -> Self {
        self.start_server = start_server;
        self
    }

    pub fn with_rpc_timeout(mut self, rpc_timeout: Duration) -> Self {
        self.rpc_timeout = rpc_timeout;
        self
    }

    pub fn with_reconnect_delay(mut self, reconnect_delay: Duration) -> Self {
        self.reconnect_delay = reconnect_delay;
        self
    }

    pub fn heartbeat_enabled(&self) -> bool {
        !self.heartbeat.is_zero()
    }

    pub fn from_toml_str(content: &str) -> EmitResult<Self> {
        let config: EmitConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> EmitResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Overrides fields from `EMIT_*` environment variables when they are set.
    pub fn apply_env(mut self) -> EmitResult<Self> {
        if let Ok(engine) = std::env::var(ENV_ENGINE) {
            self.engine = engine
                .parse()
                .map_err(|message| EmitError::InvalidConfig { message })?;
        }

        if let Ok(dsn) = std::env::var(ENV_DSN) {
            if !dsn.is_empty() {
                self.dsn = Some(dsn);
            }
        }

        if let Ok(secs) = std::env::var(ENV_HEARTBEAT_SECS) {
            let secs: f64 = secs.trim().parse().map_err(|_| EmitError::InvalidConfig {
                message: format!("{} must be a number of seconds, got {:?}", ENV_HEARTBEAT_SECS, secs),
            })?;
            self.heartbeat = duration_from_secs(secs).map_err(|message| EmitError::InvalidConfig { message })?;
        }

        if let Ok(flag) = std::env::var(ENV_START_SERVER) {
            self.start_server = matches!(
                flag.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }

        Ok(self)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.engine == Engine::Redis {
            let dsn = match &self.dsn {
                Some(dsn) if !dsn.is_empty() => dsn,
                _ => return Err("When engine is redis, dsn is required".to_string()),
            };

            if !dsn.starts_with("redis://") && !dsn.starts_with("rediss://") && !dsn.starts_with("unix://") {
                return Err("DSN must start with redis://, rediss:// or unix://".to_string());
            }
        }

        if self.rpc_timeout.is_zero() {
            return Err("RPC timeout must be greater than 0".to_string());
        }

        if self.reconnect_delay.is_zero() {
            return Err("Reconnect delay must be greater than 0".to_string());
        }

        Ok(())
    }
}

fn duration_from_secs(secs: f64) -> Result<Duration, String> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("Duration must be a non-negative number of seconds, got {}", secs));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| format!("Duration of {} seconds is out of range: {}", secs, e))
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        super::duration_from_secs(secs).map_err(serde::de::Error::custom)
    }
}
