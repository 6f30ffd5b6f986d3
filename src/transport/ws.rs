//! The websocket transport.
//!
//! One connection type serves both roles: server-accepted sockets obtained
//! from a hyper upgrade and client sockets obtained from a dial. The read
//! and write halves are split so the channel's inbound and outbound loops can
//! drive them concurrently.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http::request::Parts;
use http::{header, HeaderValue, Request, Response, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::body::ResponseBody;
use crate::config::Config;
use crate::errors::{Error, TransportError};
use crate::server::Server;
use crate::transport::Conn;

pub struct WsConn<S> {
    rx: Mutex<SplitStream<WebSocketStream<S>>>,
    tx: Mutex<SplitSink<WebSocketStream<S>, WsMessage>>,
    ping_interval: Duration,
    ping_timeout: Duration,
    receive_timeout: Duration,
    send_timeout: Duration,
}

impl<S> WsConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub(crate) fn new(ws: WebSocketStream<S>, config: &Config) -> Self {
        let (tx, rx) = ws.split();
        Self {
            rx: Mutex::new(rx),
            tx: Mutex::new(tx),
            ping_interval: config.ping_interval,
            ping_timeout: config.ping_timeout,
            receive_timeout: config.receive_timeout,
            send_timeout: config.send_timeout,
        }
    }
}

#[async_trait]
impl<S> Conn for WsConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn get_message(&self) -> Result<String, TransportError> {
        let mut rx = self.rx.lock().await;
        loop {
            let msg = match tokio::time::timeout(self.receive_timeout, rx.next()).await {
                Err(_) => return Err(TransportError::ReceiveTimeout),
                Ok(None) => return Err(TransportError::Closed),
                Ok(Some(Err(err))) => return Err(err.into()),
                Ok(Some(Ok(msg))) => msg,
            };
            match msg {
                WsMessage::Text(text) => {
                    // only text frames carry protocol data; empty ones are
                    // not allowed
                    if text.is_empty() {
                        return Err(TransportError::EmptyFrame);
                    }
                    return Ok(text);
                }
                WsMessage::Binary(_) => return Err(TransportError::BinaryMessage),
                WsMessage::Close(_) => return Err(TransportError::Closed),
                // ws-level control frames are transparent to the protocol
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
            }
        }
    }

    async fn write_message(&self, frame: String) -> Result<(), TransportError> {
        let mut tx = self.tx.lock().await;
        match tokio::time::timeout(self.send_timeout, tx.send(WsMessage::Text(frame))).await {
            Err(_) => Err(TransportError::SendTimeout),
            Ok(result) => result.map_err(Into::into),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut tx = self.tx.lock().await;
        tx.close().await.map_err(Into::into)
    }

    fn ping_params(&self) -> (Duration, Duration) {
        (self.ping_interval, self.ping_timeout)
    }
}

/// Dial a websocket endpoint.
pub(crate) async fn connect(
    url: &str,
    config: &Config,
) -> Result<WsConn<MaybeTlsStream<TcpStream>>, TransportError> {
    let (ws, _response) = connect_async(url).await?;
    Ok(WsConn::new(ws, config))
}

/// Accept a websocket request: answer the handshake and hand the upgraded
/// stream to a session task. With a `sid` this is a transport upgrade of an
/// existing polling session, otherwise a fresh connection.
pub(crate) fn new_req<ReqBody, ResBody>(
    server: Arc<Server>,
    sid: Option<String>,
    req: Request<ReqBody>,
) -> Result<Response<ResponseBody<ResBody>>, Error>
where
    ReqBody: Send + 'static,
{
    let ws_key = req
        .headers()
        .get(header::SEC_WEBSOCKET_KEY)
        .ok_or(TransportError::UpgradeFailed)?
        .clone();
    let (parts, body) = req.into_parts();
    let req = Request::from_parts(parts.clone(), body);

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await.map(hyper_util::rt::TokioIo::new) {
            Ok(stream) => {
                let ws = WebSocketStream::from_raw_socket(stream, Role::Server, None).await;
                if let Err(err) = on_init(server, ws, sid, parts).await {
                    tracing::debug!(%err, "websocket session setup failed");
                }
            }
            Err(err) => {
                tracing::debug!(%err, "websocket upgrade failed");
            }
        }
    });

    ws_response(&ws_key)
}

/// Drive a websocket session over an already-upgraded stream.
pub(crate) async fn on_init<S>(
    server: Arc<Server>,
    ws: WebSocketStream<S>,
    sid: Option<String>,
    parts: Parts,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let conn: Arc<dyn Conn> = Arc::new(WsConn::new(ws, server.config()));
    let remote_addr = parts
        .extensions
        .get::<std::net::SocketAddr>()
        .map(|addr| addr.to_string())
        .unwrap_or_default();

    match sid {
        Some(sid) => {
            server
                .setup_upgrade_event_loop(conn, remote_addr, parts.headers, sid)
                .await
        }
        None => server
            .setup_event_loop(conn, remote_addr, parts.headers)
            .await
            .map(|_| ()),
    }
}

fn ws_response<B>(ws_key: &HeaderValue) -> Result<Response<ResponseBody<B>>, Error> {
    let derived = derive_accept_key(ws_key.as_bytes());
    Ok(Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::UPGRADE, HeaderValue::from_static("websocket"))
        .header(header::CONNECTION, HeaderValue::from_static("Upgrade"))
        .header(header::SEC_WEBSOCKET_ACCEPT, derived)
        .body(ResponseBody::empty_response())?)
}
