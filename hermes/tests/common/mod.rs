use clap::Parser;
use futures_util::StreamExt;
use hermes::utils::OrError;
use hermes::{BridgeConfig, BrokerTransport, TransportEvent};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Broker transport fed by the test through a channel. Records every subscribe batch.
pub struct ChannelTransport {
    events: mpsc::UnboundedReceiver<OrError<TransportEvent>>,
    pub subscribes: Arc<Mutex<Vec<Vec<String>>>>,
}

impl ChannelTransport {
    pub fn new() -> (
        Self,
        mpsc::UnboundedSender<OrError<TransportEvent>>,
        Arc<Mutex<Vec<Vec<String>>>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscribes = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                events: rx,
                subscribes: subscribes.clone(),
            },
            tx,
            subscribes,
        )
    }
}

impl BrokerTransport for ChannelTransport {
    async fn poll(&mut self) -> OrError<TransportEvent> {
        match self.events.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        }
    }

    fn subscribe(&mut self, patterns: &[String]) -> OrError<()> {
        self.subscribes.lock().unwrap().push(patterns.to_vec());
        Ok(())
    }
}

/// Bridge config listening on an ephemeral localhost port.
pub fn test_config(topics: &str) -> BridgeConfig {
    BridgeConfig::try_parse_from([
        "bridge",
        "--mqtt-url",
        "mqtt://localhost:1883",
        "--mqtt-topics",
        topics,
        "--host",
        "127.0.0.1",
        "--ws-port",
        "0",
        "--reconnect-ms",
        "5",
    ])
    .unwrap()
}

pub async fn connect(addr: std::net::SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
    client
}

/// Next text frame from the client, or `None` if nothing arrives within `wait`.
pub async fn next_text(client: &mut Client, wait: Duration) -> Option<String> {
    loop {
        match tokio::time::timeout(wait, client.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return Some(text.as_str().to_string()),
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            Ok(other) => panic!("unexpected websocket item: {:?}", other),
            Err(_) => return None,
        }
    }
}

pub async fn next_json(client: &mut Client) -> serde_json::Value {
    let text = next_text(client, Duration::from_secs(2))
        .await
        .expect("timed out waiting for frame");
    serde_json::from_str(&text).unwrap()
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}
