//! Central defaults for the bridge. Every value here can be overridden from the command line or environment.

/// Broker the bridge subscribes to when `MQTT_URL` is not set
pub const DEFAULT_MQTT_URL: &str = "mqtt://captain.dev0.pandor.cloud:1884";

/// Comma-separated subscription set used when `MQTT_TOPICS` is not set
pub const DEFAULT_MQTT_TOPICS: &str = "classroom/+/telemetry,flipper/+/+";

/// Default port for downstream WebSocket clients
pub const WS_PORT: u16 = 8080;

/// Default bind address for downstream WebSocket clients
pub const WS_HOST: &str = "0.0.0.0";

/// Port used when the broker URL does not carry one
pub const MQTT_DEFAULT_PORT: u16 = 1883;

/// Upper bound on a single broker connect attempt
pub const MQTT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Delay between broker reconnect attempts
pub const MQTT_RECONNECT_MS: u64 = 1_000;

pub const MQTT_KEEP_ALIVE_SECS: u64 = 30;

/// Capacity of the rumqttc request channel between `AsyncClient` and `EventLoop`
pub const MQTT_REQUEST_CAPACITY: usize = 64;

/// Frames queued per downstream connection before it is treated as dead
pub const WS_QUEUE_CAPACITY: usize = 1024;

pub const CLIENT_ID_PREFIX: &str = "hermes-bridge";
