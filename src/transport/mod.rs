//! The transport capability consumed by the core.
//!
//! A [`Conn`] is one live, frame-oriented connection: the polling variant
//! bridges HTTP request/response pairs into frames, the websocket variant
//! maps frames onto text messages. The channel loops only ever see this
//! trait.

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::TransportError;

pub mod polling;
pub mod polling_client;
pub mod ws;

/// Inbound sentinel telling the channel's inbound loop to exit without
/// closing: the transport has been quiesced externally (polling retire after
/// the close terminator was served). Never decoded.
pub(crate) const STOP_MESSAGE: &str = "stop";

/// A frame-oriented duplex connection.
///
/// `get_message` and `write_message` are called from different tasks of the
/// same channel and must therefore tolerate concurrent use.
#[async_trait]
pub trait Conn: Send + Sync {
    /// Read the next text frame. Bounded by the transport receive timeout.
    async fn get_message(&self) -> Result<String, TransportError>;

    /// Write one text frame. Bounded by the transport send timeout.
    async fn write_message(&self, frame: String) -> Result<(), TransportError>;

    /// Tear the connection down. Pending reads observe an error afterwards.
    async fn close(&self) -> Result<(), TransportError>;

    /// The keepalive parameters of this connection: (interval, timeout).
    fn ping_params(&self) -> (Duration, Duration);
}
