mod methods;

use clap::{Parser, Subcommand};
use emitter::prelude::*;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Error, Debug)]
enum CliError {
    #[error("Invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error(transparent)]
    Emit(#[from] EmitError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "emitctl")]
#[command(about = "Publish, listen and call RPC methods over the emitter")]
struct Cli {
    /// Engine to use (in_process or redis)
    #[arg(long, global = true)]
    engine: Option<Engine>,
    /// Redis DSN, e.g. redis://localhost
    #[arg(long, global = true)]
    dsn: Option<String>,
    /// TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Publish one message
    Publish {
        event: String,
        /// JSON payload (null when omitted)
        payload: Option<String>,
        #[arg(short, long, default_value = "")]
        exchange: String,
    },
    /// Print messages arriving on one or more events
    Listen {
        #[arg(required = true)]
        events: Vec<String>,
        #[arg(short, long, default_value = "")]
        exchange: String,
        /// Exit after this many messages
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },
    /// Call an RPC method and print its result
    Call {
        method: String,
        /// JSON params (null when omitted)
        params: Option<String>,
        /// Timeout in seconds
        #[arg(long, default_value = "10")]
        timeout: f64,
    },
    /// Serve the built-in RPC methods until interrupted
    Serve,
    /// Run the heartbeat loop (redis engine)
    Heartbeat {
        /// Seconds between heartbeats
        #[arg(long, default_value = "1")]
        interval: f64,
        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<f64>,
    },
}

fn parse_payload(raw: Option<&str>) -> Result<Value, CliError> {
    match raw {
        Some(raw) => Ok(serde_json::from_str(raw)?),
        None => Ok(Value::Null),
    }
}

fn seconds(value: f64, what: &str) -> Result<Duration, CliError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(CliError::Config(format!("{} must be a positive number of seconds", what)));
    }
    Duration::try_from_secs_f64(value)
        .map_err(|e| CliError::Config(format!("{} of {} seconds is out of range: {}", what, value, e)))
}

/// Config file first, then `EMIT_*` variables, then command-line flags.
fn resolve_config(cli: &Cli) -> Result<EmitConfig, CliError> {
    let mut config = match &cli.config {
        Some(path) => EmitConfig::from_file(path)?,
        None => EmitConfig::default(),
    }
    .apply_env()?;

    if let Some(engine) = cli.engine {
        config.engine = engine;
    }
    if let Some(dsn) = &cli.dsn {
        config.dsn = Some(dsn.clone());
        if cli.engine.is_none() {
            config.engine = Engine::Redis;
        }
    }

    match &cli.command {
        Commands::Serve => config.start_server = true,
        Commands::Heartbeat { interval, .. } => {
            config.heartbeat = seconds(*interval, "interval")?;
            if config.engine != Engine::Redis {
                return Err(CliError::Config("heartbeat requires the redis engine".to_string()));
            }
        }
        Commands::Call { timeout, .. } => config.rpc_timeout = seconds(*timeout, "timeout")?,
        _ => {}
    }

    config.validate().map_err(CliError::Config)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = resolve_config(&cli)?;
    let emitter = Emitter::new(config)?;

    let result = match &cli.command {
        Commands::Publish {
            event,
            payload,
            exchange,
        } => publish(&emitter, exchange, event, payload.as_deref()).await,
        Commands::Listen {
            events,
            exchange,
            count,
        } => listen(&emitter, exchange, events, *count).await,
        Commands::Call { method, params, .. } => call(&emitter, method, params.as_deref()).await,
        Commands::Serve => serve(&emitter).await,
        Commands::Heartbeat { duration, .. } => heartbeat(&emitter, *duration).await,
    };

    emitter.stop().await;
    result.map_err(Into::into)
}

async fn publish(emitter: &Emitter, exchange: &str, event: &str, payload: Option<&str>) -> Result<(), CliError> {
    let message = parse_payload(payload)?;
    if emitter.engine() == Engine::InProcess {
        warn!("publishing with the in_process engine reaches no other process");
    }

    emitter.start().await?;
    emitter.emit_in(exchange, event, &message).await?;
    info!("published on {}", topic(exchange, event));
    Ok(())
}

async fn listen(emitter: &Emitter, exchange: &str, events: &[String], count: Option<usize>) -> Result<(), CliError> {
    let (sender, mut receiver) = mpsc::unbounded_channel::<()>();

    for event in events {
        let channel = topic(exchange, event);
        let sender = sender.clone();
        emitter.on_in(
            exchange,
            event,
            handler_fn(format!("print {}", channel), move |message: Value| {
                let sender = sender.clone();
                let channel = channel.clone();
                async move {
                    println!("{} {}", channel, message);
                    let _ = sender.send(());
                    Ok::<(), EmitError>(())
                }
            }),
        );
    }

    emitter.start().await?;
    info!("listening on {} event(s), Ctrl-C to quit", events.len());

    let mut received = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            delivered = receiver.recv() => {
                if delivered.is_none() {
                    break;
                }
                received += 1;
                if count.is_some_and(|count| received >= count) {
                    break;
                }
            }
        }
    }

    Ok(())
}

async fn call(emitter: &Emitter, method: &str, params: Option<&str>) -> Result<(), CliError> {
    let params = parse_payload(params)?;

    emitter.start().await?;
    let result = emitter.rpc_send(method, &params).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn serve(emitter: &Emitter) -> Result<(), CliError> {
    methods::register_builtins(emitter);
    emitter.start().await?;

    info!("serving rpc methods {:?}, Ctrl-C to quit", methods::BUILTIN_METHODS);
    tokio::signal::ctrl_c().await?;
    Ok(())
}

async fn heartbeat(emitter: &Emitter, duration: Option<f64>) -> Result<(), CliError> {
    emitter.on(
        HEARTBEAT_EVENT,
        handler_fn("print heartbeat", |message: Value| async move {
            println!("{}", message);
            Ok::<(), EmitError>(())
        }),
    );
    emitter.start().await?;

    match duration {
        Some(duration) => {
            let duration = seconds(duration, "duration")?;
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = tokio::time::sleep(duration) => {}
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("emitctl").chain(args.iter().copied())).unwrap()
    }

    fn clear_env() {
        for key in [
            emitter::config::ENV_ENGINE,
            emitter::config::ENV_DSN,
            emitter::config::ENV_HEARTBEAT_SECS,
            emitter::config::ENV_START_SERVER,
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_parse_publish() {
        let cli = parse(&["publish", "echo", "{\"msg\": 1}", "--exchange", "orders"]);
        match cli.command {
            Commands::Publish {
                event,
                payload,
                exchange,
            } => {
                assert_eq!(event, "echo");
                assert_eq!(payload.as_deref(), Some("{\"msg\": 1}"));
                assert_eq!(exchange, "orders");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_listen_requires_event() {
        assert!(Cli::try_parse_from(["emitctl", "listen"]).is_err());
        let cli = parse(&["listen", "a", "b", "-n", "3"]);
        assert!(matches!(cli.command, Commands::Listen { ref events, count: Some(3), .. } if events.len() == 2));
    }

    #[test]
    fn test_parse_payload() {
        assert_eq!(parse_payload(None).unwrap(), Value::Null);
        assert_eq!(parse_payload(Some("[1,2]")).unwrap(), serde_json::json!([1, 2]));
        assert!(matches!(parse_payload(Some("{oops")), Err(CliError::InvalidJson(_))));
    }

    #[test]
    #[serial]
    fn test_resolve_config_defaults() {
        clear_env();
        let config = resolve_config(&parse(&["publish", "x"])).unwrap();
        assert_eq!(config.engine, Engine::InProcess);

        let config = resolve_config(&parse(&["serve"])).unwrap();
        assert!(config.start_server);

        let config = resolve_config(&parse(&["call", "ping", "--timeout", "2.5"])).unwrap();
        assert_eq!(config.rpc_timeout, Duration::from_millis(2500));
        assert!(resolve_config(&parse(&["call", "ping", "--timeout", "0"])).is_err());
        assert!(matches!(
            resolve_config(&parse(&["call", "ping", "--timeout", "1e20"])),
            Err(CliError::Config(_))
        ));
    }

    #[test]
    #[serial]
    fn test_resolve_config_layers() {
        clear_env();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "engine = \"redis\"\ndsn = \"redis://from-file\"").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = resolve_config(&parse(&["--config", &path, "publish", "x"])).unwrap();
        assert_eq!(config.dsn.as_deref(), Some("redis://from-file"));

        std::env::set_var(emitter::config::ENV_DSN, "redis://from-env");
        let config = resolve_config(&parse(&["--config", &path, "publish", "x"])).unwrap();
        assert_eq!(config.dsn.as_deref(), Some("redis://from-env"));

        let config = resolve_config(&parse(&["--config", &path, "--dsn", "redis://from-flag", "publish", "x"])).unwrap();
        assert_eq!(config.dsn.as_deref(), Some("redis://from-flag"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_resolve_config_heartbeat_needs_redis() {
        clear_env();
        assert!(matches!(
            resolve_config(&parse(&["heartbeat"])),
            Err(CliError::Config(_))
        ));

        let config = resolve_config(&parse(&["--dsn", "redis://localhost", "heartbeat", "--interval", "0.5"])).unwrap();
        assert_eq!(config.engine, Engine::Redis);
        assert_eq!(config.heartbeat, Duration::from_millis(500));
    }
}
