//! The client dialer.

use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use serde::Serialize;

use crate::channel::{Channel, ConnectionHeader};
use crate::config::Config;
use crate::errors::Error;
use crate::handler::{AckHandler, Handlers, MessageHandler};
use crate::transport::polling_client::PollingClientConn;
use crate::transport::{ws, Conn};

const WEBSOCKET_PATH: &str = "/socket.io/?EIO=3&transport=websocket";
const POLLING_PATH: &str = "/socket.io/?EIO=3&transport=polling";

/// The socket.io URL for a websocket connection to `host:port`.
pub fn websocket_url(host: &str, port: u16, secure: bool) -> String {
    let scheme = if secure { "wss" } else { "ws" };
    format!("{scheme}://{host}:{port}{WEBSOCKET_PATH}")
}

/// The socket.io URL for a long-polling connection to `host:port`.
pub fn polling_url(host: &str, port: u16, secure: bool) -> String {
    let scheme = if secure { "https" } else { "http" };
    format!("{scheme}://{host}:{port}{POLLING_PATH}")
}

/// A connected socket.io client. The transport is picked from the URL
/// scheme: `ws`/`wss` dials a websocket, `http`/`https` a polling session.
pub struct Client {
    channel: Arc<Channel>,
    handlers: Arc<Handlers>,
}

impl Client {
    /// Dial `url` with default [`Config`]. See [`websocket_url`] and
    /// [`polling_url`] for the expected shapes.
    pub async fn connect(url: &str) -> Result<Self, Error> {
        Self::connect_with(url, Config::default()).await
    }

    pub async fn connect_with(url: &str, config: Config) -> Result<Self, Error> {
        let handlers = Arc::new(Handlers::default());
        let conn: Arc<dyn Conn> = if url.starts_with("ws://") || url.starts_with("wss://") {
            Arc::new(ws::connect(url, &config).await?)
        } else {
            Arc::new(PollingClientConn::connect(url, &config).await?)
        };

        // The header arrives with the server's Open frame; the inbound loop
        // fills it in and fires "connection".
        let channel = Channel::new(
            conn,
            handlers.clone(),
            None,
            ConnectionHeader::default(),
            String::new(),
            HeaderMap::new(),
        );
        channel.spawn_loops();

        Ok(Self { channel, handlers })
    }

    /// Bind a fire-and-forget handler to an event name. Registering
    /// `"connection"` is useful to learn when the handshake completed.
    pub fn on<T>(&self, name: impl Into<String>, handler: impl MessageHandler<T>) {
        self.handlers.on(name, handler);
    }

    /// Bind a handler whose return value answers incoming ack requests.
    pub fn on_ack<T>(&self, name: impl Into<String>, handler: impl AckHandler<T>) {
        self.handlers.on_ack(name, handler);
    }

    /// Fire-and-forget an event to the server.
    pub async fn emit<T: Serialize + ?Sized>(&self, event: &str, payload: &T) -> Result<(), Error> {
        self.channel.emit(event, payload).await
    }

    /// Emit an event and await the server's acknowledgement.
    pub async fn ack<T: Serialize + ?Sized>(
        &self,
        event: &str,
        payload: &T,
        timeout: Duration,
    ) -> Result<String, Error> {
        self.channel.ack(event, payload, timeout).await
    }

    /// The session id assigned by the server, empty before the handshake
    /// completed.
    pub fn id(&self) -> String {
        self.channel.id()
    }

    pub fn is_alive(&self) -> bool {
        self.channel.is_alive()
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub async fn close(&self) -> Result<(), Error> {
        self.channel.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_shapes() {
        assert_eq!(
            websocket_url("example.org", 3000, false),
            "ws://example.org:3000/socket.io/?EIO=3&transport=websocket"
        );
        assert_eq!(
            websocket_url("example.org", 443, true),
            "wss://example.org:443/socket.io/?EIO=3&transport=websocket"
        );
        assert_eq!(
            polling_url("localhost", 8080, false),
            "http://localhost:8080/socket.io/?EIO=3&transport=polling"
        );
        assert_eq!(
            polling_url("localhost", 8443, true),
            "https://localhost:8443/socket.io/?EIO=3&transport=polling"
        );
    }
}
