//! The server side of the XHR long-polling transport.
//!
//! A [`PollingConn`] bridges the frame-oriented [`Conn`] capability onto HTTP
//! request/response cycles: outbound frames wait for the next GET and are
//! written as `<length>:<payload>`, inbound POST bodies are stripped of their
//! length prefix and handed to the channel's inbound loop. The connection is
//! addressed between requests through a session table keyed by sid.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, Method, Request, Response, StatusCode};
use http_body::Body;
use http_body_util::BodyExt;
use tokio::sync::oneshot;

use crate::body::ResponseBody;
use crate::config::Config;
use crate::errors::{Error, TransportError};
use crate::protocol::CLOSE_MESSAGE;
use crate::transport::{Conn, STOP_MESSAGE};

/// Close/upgrade terminator frame delivered to the polling client.
const TERMINATOR: &str = "1:6";

/// An outbound frame paired with its delivery acknowledgement.
type OutboundFrame = (String, oneshot::Sender<()>);

pub(crate) struct PollingTransport {
    sessions: Mutex<HashMap<String, Arc<PollingConn>>>,
    config: Config,
}

impl PollingTransport {
    pub(crate) fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            config,
        })
    }

    /// Create a fresh connection for an opening request. It only becomes
    /// addressable once [`set_sid`](Self::set_sid) registers it.
    pub(crate) fn handle_connection(self: &Arc<Self>) -> Arc<PollingConn> {
        let (events_in_tx, events_in_rx) = flume::bounded(100);
        let (events_out_tx, events_out_rx) = flume::bounded(100);
        Arc::new(PollingConn {
            transport: Arc::downgrade(self),
            events_in_tx,
            events_in_rx,
            events_out_tx,
            events_out_rx,
            sid: OnceLock::new(),
            ping_interval: self.config.ping_interval,
            ping_timeout: self.config.ping_timeout,
            receive_timeout: self.config.receive_timeout,
            send_timeout: self.config.send_timeout,
        })
    }

    /// Register a connection in the session table under its sid.
    pub(crate) fn set_sid(&self, sid: String, conn: &Arc<PollingConn>) {
        conn.sid.set(sid.clone()).ok();
        self.sessions.lock().unwrap().insert(sid, conn.clone());
    }

    fn get(&self, sid: &str) -> Option<Arc<PollingConn>> {
        self.sessions.lock().unwrap().get(sid).cloned()
    }

    fn remove(&self, sid: &str) {
        self.sessions.lock().unwrap().remove(sid);
    }

    /// Session-scoped serve: GET hands out the next outbound frame, POST
    /// delivers the body as an inbound frame.
    pub(crate) async fn serve<ReqBody, ResBody>(
        &self,
        sid: &str,
        req: Request<ReqBody>,
    ) -> Result<Response<ResponseBody<ResBody>>, Error>
    where
        ReqBody: Body + Send + 'static,
        ReqBody::Data: Send,
    {
        let conn = self.get(sid).ok_or(Error::ConnectionNotFound)?;
        if req.method() == Method::GET {
            conn.polling_writer().await
        } else if req.method() == Method::POST {
            let body = req
                .into_body()
                .collect()
                .await
                .map_err(|_| TransportError::BodyRead)?
                .to_bytes();
            let body =
                String::from_utf8(body.to_vec()).map_err(|_| TransportError::BodyRead)?;
            // strip the `<length>:` prefix
            let frame = match body.find(':') {
                Some(idx) => body[idx + 1..].to_owned(),
                None => body,
            };
            conn.events_in_tx
                .send_async(frame)
                .await
                .map_err(|_| TransportError::Closed)?;
            Ok(json_response("ok"))
        } else {
            Err(TransportError::MethodNotAllowed.into())
        }
    }
}

pub(crate) struct PollingConn {
    transport: Weak<PollingTransport>,
    events_in_tx: flume::Sender<String>,
    events_in_rx: flume::Receiver<String>,
    events_out_tx: flume::Sender<OutboundFrame>,
    events_out_rx: flume::Receiver<OutboundFrame>,
    sid: OnceLock<String>,
    ping_interval: Duration,
    ping_timeout: Duration,
    receive_timeout: Duration,
    send_timeout: Duration,
}

impl PollingConn {
    /// Answer a long-poll GET: wait up to the send timeout for one outbound
    /// frame. The close frame becomes the `1:6` terminator with its exact
    /// header set, and quiesces the inbound loop afterwards.
    pub(crate) async fn polling_writer<B>(&self) -> Result<Response<ResponseBody<B>>, Error> {
        let frame = tokio::time::timeout(self.send_timeout, self.events_out_rx.recv_async()).await;
        match frame {
            Err(_) | Ok(Err(_)) => Ok(json_response("")),
            Ok(Ok((frame, delivered))) => {
                if frame == CLOSE_MESSAGE {
                    let response = terminator_response()?;
                    delivered.send(()).ok();
                    // the remote is expected to stop polling now
                    self.events_in_tx
                        .send_async(STOP_MESSAGE.to_owned())
                        .await
                        .ok();
                    Ok(response)
                } else {
                    let body = format!("{}:{}", frame.chars().count(), frame);
                    delivered.send(()).ok();
                    Ok(json_response(body))
                }
            }
        }
    }
}

#[async_trait]
impl Conn for PollingConn {
    async fn get_message(&self) -> Result<String, TransportError> {
        match tokio::time::timeout(self.receive_timeout, self.events_in_rx.recv_async()).await {
            Err(_) => Err(TransportError::ReceiveTimeout),
            Ok(Err(_)) => Err(TransportError::Closed),
            Ok(Ok(frame)) if frame == CLOSE_MESSAGE => Err(TransportError::Closed),
            Ok(Ok(frame)) => Ok(frame),
        }
    }

    async fn write_message(&self, frame: String) -> Result<(), TransportError> {
        let (delivered_tx, delivered_rx) = oneshot::channel();
        self.events_out_tx
            .send_async((frame, delivered_tx))
            .await
            .map_err(|_| TransportError::Closed)?;
        match tokio::time::timeout(self.send_timeout, delivered_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::SendTimeout),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        // Enqueue the terminator without waiting for the next poll cycle; the
        // session entry is dropped once it is delivered (or after a grace
        // period when the client never comes back for it).
        let (delivered_tx, delivered_rx) = oneshot::channel();
        self.events_out_tx
            .try_send((CLOSE_MESSAGE.to_owned(), delivered_tx))
            .ok();

        let transport = self.transport.clone();
        let sid = self.sid.get().cloned();
        let grace = self.send_timeout;
        tokio::spawn(async move {
            tokio::time::timeout(grace, delivered_rx).await.ok();
            if let (Some(transport), Some(sid)) = (transport.upgrade(), sid) {
                transport.remove(&sid);
            }
        });
        Ok(())
    }

    fn ping_params(&self) -> (Duration, Duration) {
        (self.ping_interval, self.ping_timeout)
    }
}

/// Standard headers of a polling response.
fn json_response<B>(body: impl Into<Bytes>) -> Response<ResponseBody<B>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .header(header::PRAGMA, "no-cache")
        .header(header::EXPIRES, "0")
        .body(ResponseBody::custom_response(body))
        .expect("static headers")
}

/// The `1:6` terminator keeps the header set some historical clients key on.
fn terminator_response<B>() -> Result<Response<ResponseBody<B>>, Error> {
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CACHE_CONTROL, "no-cache, private")
        .header(header::CONTENT_LENGTH, TERMINATOR.len())
        .header(header::DATE, httpdate())
        .body(ResponseBody::custom_response(TERMINATOR))?)
}

/// Current time in RFC 7231 / IMF-fixdate shape.
fn httpdate() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}
