use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::handshake::server::ErrorResponse;
use tokio_tungstenite::tungstenite::http::header::{CONTENT_TYPE, HeaderValue};
use tokio_tungstenite::tungstenite::http::StatusCode;
use url::form_urlencoded;

use super::registry::RoomRegistry;
use super::types::{RelayError, RoomId};

/// Query parameters of a connect request: `?room=<id>&join=1`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectParams {
    pub room: Option<String>,
    /// Only the literal `join=1` asks to join an existing room
    pub join: bool,
}

impl ConnectParams {
    /// Decode a raw (percent-encoded) query string. The first occurrence of a key wins.
    pub fn from_query(query: Option<&str>) -> Self {
        let mut params = Self::default();
        let mut join = None;

        for (key, value) in form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
            match &*key {
                "room" if params.room.is_none() => params.room = Some(value.into_owned()),
                "join" if join.is_none() => join = Some(value == "1"),
                _ => {}
            }
        }

        params.join = join.unwrap_or(false);
        params
    }

    /// Validate the room and, for join attempts, check the room has exactly one occupant.
    pub fn admit(&self, registry: &RoomRegistry) -> Result<RoomId, RelayError> {
        let room = RoomId::parse(self.room.clone().unwrap_or_default())?;

        if self.join {
            if !registry.exists(&room) {
                return Err(RelayError::RoomNotFound(room));
            }
            if registry.client_count(&room) != 1 {
                return Err(RelayError::RoomFull(room));
            }
        }

        Ok(room)
    }
}

/// JSON body of a rejected connect request
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Build the HTTP response sent instead of the protocol switch
pub fn error_response(status: StatusCode, message: &str) -> ErrorResponse {
    let body = ErrorBody {
        error: message.to_string(),
    };
    // ErrorBody only holds a String, serialization cannot fail
    let json = serde_json::to_string(&body).unwrap_or_default();

    let mut response = ErrorResponse::new(Some(json));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Rejection response for an error raised before the upgrade
pub fn rejection(err: &RelayError) -> ErrorResponse {
    error_response(err.status(), &err.to_string())
}
