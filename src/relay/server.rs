use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Bytes, Message};
use tracing::{debug, error, info, warn};

use super::messages::{ConnectParams, error_response, rejection};
use super::registry::RoomRegistry;
use super::types::{ConnectionId, OutboundMessage, Peer, RelayError, RoomId};
use crate::config::{RelayConfig, normalize_path};

/// How long a finished connection waits for its writer to flush the close frame
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct RelayServer {
    registry: RoomRegistry,
    config: Arc<RelayConfig>,
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new(RelayConfig::default())
    }
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            registry: RoomRegistry::new(),
            config: Arc::new(config),
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Number of connections currently in `room`
    pub fn client_count(&self, room: &RoomId) -> usize {
        self.registry.client_count(room)
    }

    /// Bind the configured address and serve until the listener fails
    pub async fn run(self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<(), RelayError> {
        info!(
            "Relay listening on {} (path {})",
            listener.local_addr()?,
            self.config.path
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            let registry = self.registry.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, registry, config).await {
                    error!("Connection error from {}: {}", addr, e);
                }
            });
        }
    }
}

/// Keeps a connection in its room for as long as the relay task holds it.
/// Dropping it, on any exit path, takes the connection out again.
struct Registration {
    registry: RoomRegistry,
    room: RoomId,
    id: ConnectionId,
}

impl Registration {
    fn new(registry: RoomRegistry, room: RoomId, peer: Peer) -> Self {
        let id = peer.id;
        registry.register(&room, peer);
        Self { registry, room, id }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(&self.room, self.id);
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: RoomRegistry,
    config: Arc<RelayConfig>,
) -> Result<(), RelayError> {
    let mut admitted: Option<RoomId> = None;

    // admission runs before the 101 is written, so a rejected client gets a plain HTTP error
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if normalize_path(request.uri().path()) != config.path {
            return Err(error_response(StatusCode::NOT_FOUND, "Not found"));
        }

        match ConnectParams::from_query(request.uri().query()).admit(&registry) {
            Ok(room) => {
                admitted = Some(room);
                Ok(response)
            }
            Err(e) => {
                info!("Rejected {}: {}", addr, e);
                Err(rejection(&e))
            }
        }
    };

    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(tungstenite::Error::Http(response)) => {
            debug!("Handshake with {} answered with {}", addr, response.status());
            return Ok(());
        }
        Err(e) => return Err(RelayError::UpgradeFailed(e)),
    };
    let room = admitted.ok_or(RelayError::MissingRoomId)?;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let id = ConnectionId::next();

    info!("WebSocket connection {} from {} in room {}", id, addr, room);

    let (tx, mut rx) = mpsc::channel::<OutboundMessage>(config.queue_capacity);
    let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<Message>();

    let mut send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    // None: the registry let go of this peer (left, stalled or unregistered)
                    let Some(msg) = msg else {
                        break;
                    };
                    if ws_tx.send(msg.into_message()).await.is_err() {
                        break;
                    }
                }
                Some(ctrl_msg) = ctrl_rx.recv() => {
                    if ws_tx.send(ctrl_msg).await.is_err() {
                        break;
                    }
                }
                else => break,
            }
        }
        let _ = ws_tx.close().await;
    });

    // the registry owns the only sender; once it is dropped the writer closes the socket
    let (peer, mut evicted) = Peer::watched(id, tx);
    let registration = Registration::new(registry.clone(), room.clone(), peer);

    let mut ping_interval = config
        .ping_interval
        .map(|period| tokio::time::interval_at(Instant::now() + period, period));
    let mut pong_deadline: Option<Instant> = None;
    let mut writer_done = false;

    loop {
        let ping_tick = async {
            match ping_interval.as_mut() {
                Some(interval) => {
                    interval.tick().await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        let pong_timeout = async {
            match pong_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = ping_tick => {
                if pong_deadline.is_some() {
                    warn!("No Pong received, disconnecting {}", id);
                    break;
                }
                if ctrl_tx.send(Message::Ping(Bytes::new())).is_err() {
                    break;
                }
                pong_deadline = Some(Instant::now() + config.pong_timeout);
                debug!("Ping sent to {}", id);
            }

            _ = pong_timeout => {
                warn!("Pong timeout, disconnecting {}", id);
                break;
            }

            _ = &mut evicted => {
                info!("{} was dropped from room {}, closing", id, room);
                break;
            }

            _ = &mut send_task => {
                writer_done = true;
                debug!("Writer for {} stopped", id);
                break;
            }

            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        warn!("WebSocket error on {}: {}", id, e);
                        break;
                    }
                    None => break,
                };

                match msg {
                    Message::Close(_) => {
                        info!("Close received from {}", id);
                        break;
                    }
                    Message::Pong(_) => {
                        pong_deadline = None;
                        debug!("Pong received from {}", id);
                    }
                    msg => {
                        if let Some(frame) = OutboundMessage::from_message(msg) {
                            registry.broadcast(&room, id, &frame);
                        }
                    }
                }
            }
        }
    }

    drop(registration);
    drop(ctrl_tx);

    if !writer_done && tokio::time::timeout(CLOSE_GRACE, &mut send_task).await.is_err() {
        send_task.abort();
    }

    info!(
        "WebSocket disconnected: {} ({} left in room {})",
        id,
        registry.client_count(&room),
        room
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_unregisters_on_drop() {
        let registry = RoomRegistry::new();
        let room = RoomId::parse("abc").unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let peer = Peer::new(ConnectionId::next(), tx);

        let registration = Registration::new(registry.clone(), room.clone(), peer);
        assert_eq!(registry.client_count(&room), 1);

        drop(registration);
        assert_eq!(registry.client_count(&room), 0);
        assert!(registry.exists(&room));
        // the only sender went with the registry entry
        assert!(rx.try_recv().is_err());
        assert!(rx.is_closed());
    }

    #[test]
    fn registration_unregisters_on_panic() {
        let registry = RoomRegistry::new();
        let room = RoomId::parse("abc").unwrap();

        let result = std::panic::catch_unwind({
            let registry = registry.clone();
            let room = room.clone();
            move || {
                let (tx, _rx) = mpsc::channel(8);
                let peer = Peer::new(ConnectionId::next(), tx);
                let _registration = Registration::new(registry, room, peer);
                panic!("relay task blew up");
            }
        });

        assert!(result.is_err());
        assert_eq!(registry.client_count(&room), 0);
    }

    #[tokio::test]
    async fn server_exposes_client_count() {
        let server = RelayServer::default();
        let room = RoomId::parse("abc").unwrap();
        assert_eq!(server.client_count(&room), 0);

        let (tx, _rx) = mpsc::channel(8);
        server.registry().register(&room, Peer::new(ConnectionId::next(), tx));
        assert_eq!(server.client_count(&room), 1);
        assert_eq!(server.config().path, "/ws");
    }
}
