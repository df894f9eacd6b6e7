//! IoT relay binary.
//!
//! Runs either the server role (accepts WebSocket clients and streams
//! simulated temperature readings to each) or the client role (connects,
//! sends heartbeats and answers high readings with an LED command,
//! reconnecting forever).

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use relay_session::{ConsoleSink, Listener, ReconnectingClient, TraceSink, TracingSink, WsConnector};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::RelayConfig;
use logging::RelayLogFormatter;

/// Where operator trace lines go
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum TraceTarget {
    /// Plain lines on stdout
    Console,
    /// INFO events through the log formatter
    Log,
}

/// Bidirectional IoT messaging over WebSocket
#[derive(Parser, Debug)]
#[command(name = "iot-relay", version, about = "Bidirectional IoT messaging over WebSocket")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "relay.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Trace output destination
    #[arg(long, value_enum, default_value_t = TraceTarget::Console)]
    trace: TraceTarget,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept clients and stream simulated telemetry
    Server {
        /// Listen address, e.g. 0.0.0.0:22122
        #[arg(long)]
        listen: Option<String>,

        /// Upgrade path, e.g. wsDemo
        #[arg(long)]
        path: Option<String>,

        /// Interval between temperature readings, e.g. 1s
        #[arg(long)]
        telemetry_interval: Option<humantime::Duration>,

        /// Per-connection outbound queue capacity (unbounded when absent)
        #[arg(long)]
        queue_capacity: Option<usize>,
    },

    /// Connect to a server and keep reconnecting
    Client {
        /// Server URL, e.g. ws://127.0.0.1:22122/wsDemo
        #[arg(long)]
        url: Option<String>,

        /// Interval between heartbeats, e.g. 1s
        #[arg(long)]
        heartbeat_interval: Option<humantime::Duration>,

        /// Pause between connection attempts, e.g. 1s
        #[arg(long)]
        reconnect_delay: Option<humantime::Duration>,

        /// Per-connection outbound queue capacity (unbounded when absent)
        #[arg(long)]
        queue_capacity: Option<usize>,
    },
}

impl Command {
    /// Command-line values win over file and environment
    fn apply_to(&self, config: &mut RelayConfig) {
        match self {
            Command::Server {
                listen,
                path,
                telemetry_interval,
                queue_capacity,
            } => {
                if let Some(listen) = listen {
                    config.server.listen = listen.clone();
                }
                if let Some(path) = path {
                    config.server.path = path.clone();
                }
                if let Some(interval) = telemetry_interval {
                    config.server.telemetry_interval = **interval;
                }
                if queue_capacity.is_some() {
                    config.queue.capacity = *queue_capacity;
                }
            }
            Command::Client {
                url,
                heartbeat_interval,
                reconnect_delay,
                queue_capacity,
            } => {
                if let Some(url) = url {
                    config.client.url = url.clone();
                }
                if let Some(interval) = heartbeat_interval {
                    config.client.heartbeat_interval = **interval;
                }
                if let Some(delay) = reconnect_delay {
                    config.client.reconnect_delay = **delay;
                }
                if queue_capacity.is_some() {
                    config.queue.capacity = *queue_capacity;
                }
            }
        }
    }
}

async fn resolve_listen_addr(listen: &str) -> anyhow::Result<SocketAddr> {
    tokio::net::lookup_host(listen)
        .await
        .with_context(|| format!("cannot resolve listen address {:?}", listen))?
        .next()
        .with_context(|| format!("listen address {:?} resolved to nothing", listen))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("iot_relay={}", args.log_level).parse()?)
        .add_directive(format!("relay_session={}", args.log_level).parse()?)
        .add_directive(format!("relay_wire={}", args.log_level).parse()?)
        .add_directive("relay::trace=info".parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(RelayLogFormatter::new("relay"))
        .init();

    info!("Starting IoT relay v{}", env!("CARGO_PKG_VERSION"));

    let mut config = RelayConfig::load_from_file(&args.config)?;
    args.command.apply_to(&mut config);
    config.validate()?;

    let trace: Arc<dyn TraceSink> = match args.trace {
        TraceTarget::Console => Arc::new(ConsoleSink),
        TraceTarget::Log => Arc::new(TracingSink),
    };

    match args.command {
        Command::Server { .. } => {
            let addr = resolve_listen_addr(&config.server.listen).await?;
            component_info!(
                "listener",
                "Serving /{} on {} (telemetry every {})",
                config.server.path.trim_matches('/'),
                addr,
                humantime::format_duration(config.server.telemetry_interval)
            );

            let listener = Listener::new(config.listener_config(addr), trace);
            tokio::select! {
                result = listener.run() => {
                    if let Err(e) = &result {
                        component_error!("listener", "{}", e);
                    }
                    result?;
                }
                _ = tokio::signal::ctrl_c() => {
                    component_info!("listener", "Interrupted, shutting down");
                }
            }
        }
        Command::Client { .. } => {
            component_info!(
                "client",
                "Connecting to {} (retry every {})",
                config.client.url,
                humantime::format_duration(config.client.reconnect_delay)
            );

            let client = ReconnectingClient::new(WsConnector::new(config.client.url.clone()), config.client_config(), trace);
            tokio::select! {
                _ = client.run() => {
                    component_warn!("client", "Reconnect loop ended");
                }
                _ = tokio::signal::ctrl_c() => {
                    component_info!("client", "Interrupted, shutting down");
                }
            }
        }
    }

    Ok(())
}
