//! Configuration handling for the relay binary.
//!
//! Values come from the YAML config file, then environment variables, then
//! command-line flags. A missing or unparsable file falls back to defaults;
//! a bad override or an inconsistent final value is a startup error.

use anyhow::{bail, Context, Result};
use relay_session::{check_url, ClientConfig, ClientPolicy, ListenerConfig, OverflowPolicy, QueueConfig, ServerPolicy};
use relay_wire::LedState;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Relay configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RelayConfig {
    /// Server role settings
    pub server: ServerSection,
    /// Client role settings
    pub client: ClientSection,
    /// Outbound queue profile shared by both roles
    pub queue: QueueSection,
}

/// `server:` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// `host:port` to listen on
    pub listen: String,
    /// Upgrade path
    pub path: String,
    /// Limit for one upgrade request
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// Interval between temperature readings
    #[serde(with = "humantime_serde")]
    pub telemetry_interval: Duration,
    /// Upper bound of one random temperature step
    pub telemetry_range: f64,
    /// Starting temperature of every connection
    pub base_temperature: f64,
    /// LED commands are forwarded only above this
    pub threshold: f64,
    /// Temperature after a forwarded command
    pub reset_to: f64,
    /// Echo client heartbeats back
    pub echo_heartbeats: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:22122".to_string(),
            path: "wsDemo".to_string(),
            handshake_timeout: Duration::from_secs(10),
            telemetry_interval: Duration::from_secs(1),
            telemetry_range: 5.0,
            base_temperature: 70.0,
            threshold: 90.0,
            reset_to: 70.0,
            echo_heartbeats: true,
        }
    }
}

/// `client:` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// Server URL
    pub url: String,
    /// Interval between heartbeats
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Pause between connection attempts
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
    /// Temperatures above this trigger an LED command
    pub threshold: f64,
    /// Pin addressed by the LED command
    pub pin: i32,
    /// State requested by the LED command
    pub state: LedState,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:22122/wsDemo".to_string(),
            heartbeat_interval: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(1),
            threshold: 90.0,
            pin: 12,
            state: LedState::On,
        }
    }
}

/// Overflow policy as written in the config file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Overflow {
    /// Evict the oldest message
    #[default]
    DropOldest,
    /// Suspend the producer
    Block,
}

/// `queue:` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct QueueSection {
    /// Maximum pending messages per connection; unbounded when absent
    pub capacity: Option<usize>,
    /// What to do when full
    pub overflow: Overflow,
}

impl RelayConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<RelayConfig>(&content) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?} ({}), using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides()?;
        Ok(config)
    }

    /// Apply `RELAY_*` environment variable overrides
    pub fn apply_environment_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(listen) = lookup("RELAY_LISTEN") {
            info!("Listen address overridden by environment: {}", listen);
            self.server.listen = listen;
        }

        if let Some(path) = lookup("RELAY_PATH") {
            info!("Path overridden by environment: {}", path);
            self.server.path = path;
        }

        if let Some(url) = lookup("RELAY_URL") {
            info!("Server URL overridden by environment: {}", url);
            self.client.url = url;
        }

        if let Some(capacity) = lookup("RELAY_QUEUE_CAPACITY") {
            let capacity = capacity
                .parse::<usize>()
                .with_context(|| format!("RELAY_QUEUE_CAPACITY must be a number, got {:?}", capacity))?;
            info!("Queue capacity overridden by environment: {}", capacity);
            self.queue.capacity = Some(capacity);
        }

        Ok(())
    }

    /// Reject values the relay cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.server.path.trim_matches('/').is_empty() {
            bail!("server.path must not be empty");
        }
        check_url(&self.client.url).context("client.url")?;
        for (name, value) in [
            ("server.handshake_timeout", self.server.handshake_timeout),
            ("server.telemetry_interval", self.server.telemetry_interval),
            ("client.heartbeat_interval", self.client.heartbeat_interval),
        ] {
            if value.is_zero() {
                bail!("{} must be greater than zero", name);
            }
        }
        if self.queue.capacity == Some(0) {
            bail!("queue.capacity must be at least 1");
        }
        Ok(())
    }

    /// Queue profile for new connections
    pub fn queue_config(&self) -> QueueConfig {
        match self.queue.capacity {
            None => QueueConfig::unbounded(),
            Some(capacity) => {
                let overflow = match self.queue.overflow {
                    Overflow::DropOldest => OverflowPolicy::DropOldest,
                    Overflow::Block => OverflowPolicy::Block,
                };
                QueueConfig::bounded(capacity, overflow)
            }
        }
    }

    /// Listener settings for the resolved listen address
    pub fn listener_config(&self, addr: SocketAddr) -> ListenerConfig {
        ListenerConfig {
            addr,
            path: self.server.path.clone(),
            handshake_timeout: self.server.handshake_timeout,
            telemetry_interval: self.server.telemetry_interval,
            telemetry_range: self.server.telemetry_range,
            base_temperature: self.server.base_temperature,
            policy: ServerPolicy {
                threshold: self.server.threshold,
                reset_to: self.server.reset_to,
                echo_heartbeats: self.server.echo_heartbeats,
            },
            queue: self.queue_config(),
        }
    }

    /// Client driver settings
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            heartbeat_interval: self.client.heartbeat_interval,
            reconnect_delay: self.client.reconnect_delay,
            policy: ClientPolicy {
                threshold: self.client.threshold,
                pin: self.client.pin,
                state: self.client.state,
            },
            queue: self.queue_config(),
        }
    }
}
