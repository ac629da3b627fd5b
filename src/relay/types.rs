use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Bytes, Message, Utf8Bytes};

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Room ID is required")]
    MissingRoomId,

    #[error("Room does not exist")]
    RoomNotFound(RoomId),

    #[error("Room does not exist or maybe full")]
    RoomFull(RoomId),

    #[error("websocket upgrade failed: {0}")]
    UpgradeFailed(#[from] tungstenite::Error),

    #[error("delivery to {0} failed")]
    DeliveryFailed(ConnectionId),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// HTTP status used when the error is reported before the upgrade
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::MissingRoomId => StatusCode::BAD_REQUEST,
            RelayError::RoomNotFound(_) | RelayError::RoomFull(_) => StatusCode::NOT_FOUND,
            RelayError::UpgradeFailed(_) | RelayError::DeliveryFailed(_) | RelayError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Caller-chosen room name. Any non-empty string is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(String);

impl RoomId {
    pub fn parse(s: impl Into<String>) -> Result<Self, RelayError> {
        let s = s.into();
        if s.is_empty() {
            return Err(RelayError::MissingRoomId);
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity token of one accepted connection. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A relayed data frame. Text and binary frames keep their kind end to end.
///
/// Both variants are reference counted, so cloning per recipient is O(1).
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Text(Utf8Bytes),
    Binary(Bytes),
}

impl OutboundMessage {
    /// Extract the payload of a data frame; control frames yield `None`
    pub fn from_message(msg: Message) -> Option<Self> {
        match msg {
            Message::Text(text) => Some(Self::Text(text)),
            Message::Binary(bytes) => Some(Self::Binary(bytes)),
            _ => None,
        }
    }

    pub fn into_message(self) -> Message {
        match self {
            Self::Text(text) => Message::Text(text),
            Self::Binary(bytes) => Message::Binary(bytes),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for OutboundMessage {
    fn from(s: String) -> Self {
        Self::Text(Utf8Bytes::from(s))
    }
}

impl From<&'static str> for OutboundMessage {
    fn from(s: &'static str) -> Self {
        Self::Text(Utf8Bytes::from_static(s))
    }
}

impl From<Vec<u8>> for OutboundMessage {
    fn from(v: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(v))
    }
}

/// A registered connection as seen by the registry
#[derive(Debug)]
pub struct Peer {
    pub id: ConnectionId,
    /// Bounded queue feeding the connection's writer task. Closed once that task is gone.
    pub tx: mpsc::Sender<OutboundMessage>,
    /// Never sent on; dropping it tells the relay task the peer left its room
    evicted: Option<oneshot::Sender<()>>,
}

impl Peer {
    pub fn new(id: ConnectionId, tx: mpsc::Sender<OutboundMessage>) -> Self {
        Self {
            id,
            tx,
            evicted: None,
        }
    }

    /// Like [`Peer::new`], plus a receiver that resolves once this peer is dropped
    pub fn watched(
        id: ConnectionId,
        tx: mpsc::Sender<OutboundMessage>,
    ) -> (Self, oneshot::Receiver<()>) {
        let (evicted_tx, evicted_rx) = oneshot::channel();
        let peer = Self {
            id,
            tx,
            evicted: Some(evicted_tx),
        };
        (peer, evicted_rx)
    }
}
