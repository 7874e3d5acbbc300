//! TCP WebSocket listener for downstream clients.
//! Each connection gets a bounded outbound queue registered with the `FanoutRegistry` and a writer task draining it;
//! the read half only watches for closure since clients have no command path.

use crate::envelope::Frame;
use crate::hermes_error_cause;
use crate::registry::FanoutRegistry;
use crate::utils::OrError;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

pub struct DownstreamServer {
    local_addr: SocketAddr,
    task_handle: JoinHandle<()>,
}

impl DownstreamServer {
    /// Binds the listener and starts accepting WebSocket clients in the background.
    /// Error: bind fails → propagates to `Bridge::start`. Per-connection errors are logged only.
    pub async fn bind(
        addr: SocketAddr,
        registry: Arc<FanoutRegistry>,
        queue_capacity: usize,
    ) -> OrError<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            hermes_error_cause!("server::DownstreamServer", "bind", &format!("failed to bind {}", addr), e)
        })?;
        let local_addr = listener.local_addr().map_err(|e| {
            hermes_error_cause!("server::DownstreamServer", "bind", "failed to read local address", e)
        })?;
        info!("listening on ws://{}", local_addr);

        let task_handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((tcp_stream, peer_addr)) => {
                        let registry = registry.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(tcp_stream, registry, queue_capacity).await {
                                warn!("connection from {} error: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => warn!("accept error: {}", e),
                }
            }
        });

        Ok(Self {
            local_addr,
            task_handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for DownstreamServer {
    fn drop(&mut self) {
        self.task_handle.abort();
    }
}

// One downstream client: handshake → register → pump queue to socket until either side closes → deregister.
async fn serve_connection(
    tcp_stream: TcpStream,
    registry: Arc<FanoutRegistry>,
    queue_capacity: usize,
) -> OrError<()> {
    let ws_stream = accept_async(tcp_stream).await.map_err(|e| {
        hermes_error_cause!("server", "serve_connection", "WebSocket upgrade failed", e)
    })?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (tx, rx) = mpsc::channel::<Frame>(queue_capacity);
    let id = registry.accept(tx)?;

    // Writer: drains this connection's queue. Ends when the registry drops the sender or the socket fails.
    let mut writer = tokio::spawn(async move {
        let mut outbound = ReceiverStream::new(rx);
        while let Some(frame) = outbound.next().await {
            if ws_sender.send(Message::Text(frame)).await.is_err() {
                return;
            }
        }
        let _ = ws_sender.close().await;
    });

    // Reader: inbound frames are ignored; close or error ends the connection
    let reader = async {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(connection = %id, "read error: {}", e);
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = &mut writer => {},
        _ = reader => {},
    }
    registry.remove(id);
    writer.abort();
    Ok(())
}
