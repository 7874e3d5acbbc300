pub mod bridge;
pub mod broker;
pub mod config;
pub mod constants;
pub mod envelope;
pub mod registry;
pub mod server;
pub mod utils;

// Re-export the main types at the top level for easy access
pub use bridge::Bridge;
pub use broker::{BrokerLink, BrokerTransport, MqttTransport, TransportEvent};
pub use config::BridgeConfig;
pub use envelope::{Envelope, Kind, Payload, RawMessage, normalize};
pub use registry::{ConnectionId, FanoutRegistry};
