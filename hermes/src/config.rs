//! Process configuration, read once at startup from flags or the environment.

use crate::broker::{BrokerOptions, LinkSettings, ReconnectPolicy};
use crate::constants::{
    DEFAULT_MQTT_TOPICS, DEFAULT_MQTT_URL, MQTT_CONNECT_TIMEOUT_MS, MQTT_RECONNECT_MS, WS_HOST, WS_PORT,
    WS_QUEUE_CAPACITY,
};
use crate::hermes_error;
use crate::utils::{OrError, parse_topics};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Hermes Bridge - republishes MQTT traffic to WebSocket clients", long_about = None)]
pub struct BridgeConfig {
    /// Broker to subscribe to
    #[arg(long, env = "MQTT_URL", default_value = DEFAULT_MQTT_URL)]
    pub mqtt_url: String,

    /// Comma-separated topic patterns, wildcards allowed
    #[arg(long, env = "MQTT_TOPICS", default_value = DEFAULT_MQTT_TOPICS)]
    pub mqtt_topics: String,

    #[arg(short, long, env = "WS_PORT", default_value_t = WS_PORT)]
    pub ws_port: u16,

    #[arg(long, env = "WS_HOST", default_value = WS_HOST)]
    pub host: IpAddr,

    #[arg(long, env = "MQTT_CONNECT_TIMEOUT_MS", default_value_t = MQTT_CONNECT_TIMEOUT_MS)]
    pub connect_timeout_ms: u64,

    #[arg(long, env = "MQTT_RECONNECT_MS", default_value_t = MQTT_RECONNECT_MS)]
    pub reconnect_ms: u64,

    /// Enables capped exponential backoff when larger than --reconnect-ms
    #[arg(long, env = "MQTT_RECONNECT_MAX_MS")]
    pub reconnect_max_ms: Option<u64>,

    /// Frames buffered per WebSocket client before it is dropped as too slow
    #[arg(long, env = "WS_QUEUE_CAPACITY", default_value_t = WS_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,
}

impl BridgeConfig {
    pub fn topics(&self) -> Vec<String> {
        parse_topics(&self.mqtt_topics)
    }

    /// Subscription set shared by the broker link and the registry.
    /// Error: topic list is empty after trimming.
    pub fn subscriptions(&self) -> OrError<Arc<[String]>> {
        let topics = self.topics();
        if topics.is_empty() {
            return Err(hermes_error!("config::BridgeConfig", "subscriptions", "MQTT topic list is empty"));
        }
        Ok(topics.into())
    }

    pub fn broker_options(&self) -> OrError<BrokerOptions> {
        BrokerOptions::from_url(&self.mqtt_url, self.connect_timeout())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let interval = Duration::from_millis(self.reconnect_ms);
        match self.reconnect_max_ms {
            Some(max) => ReconnectPolicy::capped(interval, Duration::from_millis(max)),
            None => ReconnectPolicy::fixed(interval),
        }
    }

    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            connect_timeout: self.connect_timeout(),
            reconnect: self.reconnect_policy(),
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.ws_port)
    }

    /// Rejects configurations the bridge cannot run with. Called before anything is bound or spawned.
    pub fn validate(&self) -> OrError<()> {
        self.subscriptions()?;
        self.broker_options()?;
        if self.connect_timeout_ms == 0 {
            return Err(hermes_error!("config::BridgeConfig", "validate", "connect timeout must be positive"));
        }
        if self.reconnect_ms == 0 {
            return Err(hermes_error!("config::BridgeConfig", "validate", "reconnect interval must be positive"));
        }
        if self.queue_capacity == 0 {
            return Err(hermes_error!("config::BridgeConfig", "validate", "queue capacity must be positive"));
        }
        Ok(())
    }
}
