use http::{Response, StatusCode};
use tokio_tungstenite::tungstenite;

use crate::body::ResponseBody;

/// Errors produced while decoding or encoding wire frames.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame carries no recognizable type discriminator.
    #[error("wrong message type")]
    WrongMessageType,
    /// The frame has a valid discriminator but a malformed tail.
    #[error("wrong packet")]
    WrongPacket,
}

/// Errors produced by a transport connection.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("receive timed out")]
    ReceiveTimeout,
    #[error("send timed out")]
    SendTimeout,
    #[error("connection closed")]
    Closed,
    #[error("binary messages are not supported")]
    BinaryMessage,
    #[error("empty frame")]
    EmptyFrame,
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("http upgrade failed")]
    UpgradeFailed,
    #[error("handshake failed")]
    Handshake,
    #[error("request body could not be read")]
    BodyRead,
    #[error("unexpected polling response: {0}")]
    BadResponse(String),
    #[error("ws transport error: {0}")]
    Ws(#[from] Box<tungstenite::Error>),
    #[error("http client error: {0}")]
    HttpClient(#[from] reqwest::Error),
}

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        TransportError::Ws(Box::new(err))
    }
}

/// The error type surfaced by every public operation of the crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The `Open` payload could not be decoded into a connection header.
    #[error("wrong header")]
    WrongHeader,
    /// No waiter is registered for an ack id.
    #[error("waiter not found")]
    WaiterNotFound,
    /// The remote did not answer an ack request in time.
    #[error("ack timed out")]
    SendTimeout,
    /// The outbound queue of the channel is saturated.
    #[error("socket overflood")]
    SocketOverflood,
    /// A server-side operation was attempted on a channel without a server.
    #[error("server not set")]
    ServerNotSet,
    /// No channel is registered under the requested session id.
    #[error("connection not found")]
    ConnectionNotFound,
    /// The `transport` query parameter is missing or names no known
    /// transport.
    #[error("unknown transport")]
    UnknownTransport,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] http::Error),
}

impl Error {
    /// Convert the error into an http response for the front door.
    ///
    /// Known client mistakes map to 4xx, everything else to a 500.
    pub(crate) fn into_response<B>(self) -> Response<ResponseBody<B>> {
        let resp = |status: StatusCode, body: &'static str| {
            Response::builder()
                .status(status)
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(ResponseBody::custom_response(body))
                .unwrap()
        };
        match self {
            Error::ConnectionNotFound => resp(
                StatusCode::BAD_REQUEST,
                "{\"code\":\"1\",\"message\":\"Session ID unknown\"}",
            ),
            Error::Transport(TransportError::MethodNotAllowed) => Response::builder()
                .status(StatusCode::METHOD_NOT_ALLOWED)
                .body(ResponseBody::empty_response())
                .unwrap(),
            Error::Protocol(_)
            | Error::UnknownTransport
            | Error::Transport(TransportError::UpgradeFailed) => {
                Response::builder()
                    .status(StatusCode::BAD_REQUEST)
                    .body(ResponseBody::empty_response())
                    .unwrap()
            }
            e => {
                tracing::debug!("uncaught front door error: {e:?}");
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(ResponseBody::empty_response())
                    .unwrap()
            }
        }
    }
}
