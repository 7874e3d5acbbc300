//! Wiring: broker link → normalizer → fan-out registry, plus the downstream listener.
//! Three tasks: the broker link, the sequential message pipeline and the WebSocket accept loop.

use crate::broker::{BrokerLink, BrokerTransport, MqttTransport};
use crate::config::BridgeConfig;
use crate::envelope::{Kind, RawMessage, normalize};
use crate::registry::FanoutRegistry;
use crate::server::DownstreamServer;
use crate::utils::OrError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub struct Bridge {
    registry: Arc<FanoutRegistry>,
    server: DownstreamServer,
    endpoint: String,
    link_handle: JoinHandle<()>,
    pipeline_handle: JoinHandle<()>,
}

impl Bridge {
    /// Starts the bridge against the broker named in `config`.
    /// Error: invalid config or listener bind fails. Broker connectivity problems are never errors here.
    /// Called by: `bin/bridge.rs`
    pub async fn start(config: &BridgeConfig) -> OrError<Self> {
        let options = config.broker_options()?;
        let endpoint = options.endpoint();
        Self::with_transport(config, MqttTransport::new(&options), endpoint).await
    }

    /// Starts the bridge over any broker transport.
    /// Error: `config.validate()` fails or listener bind fails. Nothing is bound or spawned on an invalid config.
    pub async fn with_transport<T>(
        config: &BridgeConfig,
        transport: T,
        endpoint: impl Into<String>,
    ) -> OrError<Self>
    where
        T: BrokerTransport + 'static,
    {
        config.validate()?;
        let subscriptions = config.subscriptions()?;
        let registry = Arc::new(FanoutRegistry::new(subscriptions.clone()));
        let server =
            DownstreamServer::bind(config.listen_addr(), registry.clone(), config.queue_capacity).await?;

        let endpoint: String = endpoint.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let link = BrokerLink::new(transport, subscriptions, config.link_settings(), endpoint.clone(), tx);
        let link_handle = tokio::spawn(link.run());
        let pipeline_handle = tokio::spawn(run_pipeline(rx, registry.clone()));

        Ok(Self {
            registry,
            server,
            endpoint,
            link_handle,
            pipeline_handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Broker endpoint without credentials.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn registry(&self) -> &Arc<FanoutRegistry> {
        &self.registry
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.link_handle.abort();
        self.pipeline_handle.abort();
    }
}

/// Normalizes and broadcasts messages one at a time, preserving broker order for every connection.
pub async fn run_pipeline(mut rx: mpsc::UnboundedReceiver<RawMessage>, registry: Arc<FanoutRegistry>) {
    while let Some(raw) = rx.recv().await {
        let envelope = normalize(&raw.topic, &raw.payload);
        match envelope.kind() {
            Kind::Telemetry => info!("[telemetry] {}", envelope.summary()),
            Kind::Flipper => info!("[flipper] {}", envelope.summary()),
            Kind::Unknown => info!("[mqtt] {}", envelope.summary()),
        }
        let report = registry.broadcast(&envelope);
        debug!(
            attempted = report.attempted,
            delivered = report.delivered,
            removed = report.removed,
            "broadcast {}",
            envelope.topic()
        );
    }
}
