//! The embeddable server: session directory, room registry and the HTTP
//! front door that dispatches polling and websocket requests, including the
//! quiesce-and-replace sequence of a transport upgrade.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use http::{HeaderMap, Request, Response, Uri};
use http_body::Body;
use serde::Serialize;

use crate::body::ResponseBody;
use crate::channel::{Channel, ConnectionHeader};
use crate::config::Config;
use crate::errors::Error;
use crate::handler::{AckHandler, Handlers, MessageHandler, ON_CONNECTION};
use crate::protocol::{self, Message, MessageType};
use crate::rooms::Rooms;
use crate::sid;
use crate::transport::polling::PollingTransport;
use crate::transport::{ws, Conn};

/// A socket.io server. Mount it on an HTTP router through
/// [`SocketIoService`](crate::service::SocketIoService) or feed it requests
/// directly with [`handle_request`](Server::handle_request).
pub struct Server {
    config: Config,
    handlers: Arc<Handlers>,
    rooms: Rooms,
    sids: RwLock<HashMap<String, Arc<Channel>>>,
    polling: Arc<PollingTransport>,
}

impl Server {
    pub fn new(config: Config) -> Arc<Self> {
        let polling = PollingTransport::new(config.clone());
        let server = Arc::new(Self {
            config,
            handlers: Arc::new(Handlers::default()),
            rooms: Rooms::default(),
            sids: RwLock::new(HashMap::new()),
            polling,
        });

        let weak = Arc::downgrade(&server);
        let on_connect = {
            let weak = weak.clone();
            Box::new(move |c: &Arc<Channel>| {
                if let Some(server) = weak.upgrade() {
                    server.sids.write().unwrap().insert(c.id(), c.clone());
                }
            })
        };
        let on_disconnect = Box::new(move |c: &Arc<Channel>| {
            if let Some(server) = weak.upgrade() {
                // room indexes first, then the session directory
                server.rooms.leave_all(c);
                server.sids.write().unwrap().remove(&c.id());
            }
        });
        server.handlers.set_system(on_connect, on_disconnect);
        server
    }

    /// Bind a fire-and-forget handler to an event name. `"connection"`,
    /// `"disconnection"` and `"error"` are valid names; for the first two the
    /// handler runs after the built-in session bookkeeping.
    pub fn on<T>(&self, name: impl Into<String>, handler: impl MessageHandler<T>) {
        self.handlers.on(name, handler);
    }

    /// Bind a handler whose return value answers incoming ack requests.
    pub fn on_ack<T>(&self, name: impl Into<String>, handler: impl AckHandler<T>) {
        self.handlers.on_ack(name, handler);
    }

    /// Look a channel up by its session id.
    pub fn get_channel(&self, sid: &str) -> Result<Arc<Channel>, Error> {
        self.sids
            .read()
            .unwrap()
            .get(sid)
            .cloned()
            .ok_or(Error::ConnectionNotFound)
    }

    /// Number of connected sessions.
    pub fn amount_of_sids(&self) -> usize {
        self.sids.read().unwrap().len()
    }

    /// Number of rooms with at least one member.
    pub fn amount_of_rooms(&self) -> usize {
        self.rooms.count()
    }

    /// Number of channels joined to `room`.
    pub fn amount(&self, room: &str) -> usize {
        self.rooms.amount(room)
    }

    /// Snapshot of the channels joined to `room`.
    pub fn list(&self, room: &str) -> Vec<Arc<Channel>> {
        self.rooms.list(room)
    }

    /// Emit an event to every live channel of `room`. Individual failures do
    /// not abort the broadcast.
    pub fn broadcast_to<T: Serialize>(&self, room: &str, event: &str, payload: &T) {
        self.broadcast(self.rooms.list(room), event, payload);
    }

    /// Emit an event to every live session.
    pub fn broadcast_to_all<T: Serialize>(&self, event: &str, payload: &T) {
        let channels: Vec<_> = self.sids.read().unwrap().values().cloned().collect();
        self.broadcast(channels, event, payload);
    }

    fn broadcast<T: Serialize>(&self, channels: Vec<Arc<Channel>>, event: &str, payload: &T) {
        let mut msg = Message::emit(event);
        msg.args = match serde_json::to_string(payload) {
            Ok(args) => args,
            Err(err) => {
                tracing::warn!(event, %err, "broadcast payload serialization failed");
                return;
            }
        };
        let frame = match protocol::encode(&msg) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(event, %err, "broadcast frame encoding failed");
                return;
            }
        };
        for channel in channels {
            if channel.is_alive() {
                let frame = frame.clone();
                tokio::spawn(async move {
                    if let Err(err) = channel.send_raw(frame).await {
                        tracing::debug!(sid = %channel.id(), %err, "broadcast emit failed");
                    }
                });
            }
        }
    }

    pub(crate) fn rooms(&self) -> &Rooms {
        &self.rooms
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    /// The HTTP front door: dispatch on the `transport` and `sid` query
    /// parameters.
    pub async fn handle_request<ReqBody, ResBody>(
        self: &Arc<Self>,
        req: Request<ReqBody>,
    ) -> Result<Response<ResponseBody<ResBody>>, Error>
    where
        ReqBody: Body + Send + 'static,
        ReqBody::Data: Send,
    {
        let sid = query_param(req.uri(), "sid");
        let transport = query_param(req.uri(), "transport");

        match transport.as_deref() {
            Some("polling") => {
                // sid is empty on the very first polling request only
                if let Some(sid) = sid {
                    return self.polling.serve(&sid, req).await;
                }
                let conn = self.polling.handle_connection();
                let remote_addr = remote_addr(&req);
                let request_headers = req.headers().clone();
                let channel = self
                    .setup_event_loop(conn.clone(), remote_addr, request_headers)
                    .await?;
                self.polling.set_sid(channel.id(), &conn);
                tracing::debug!(sid = %channel.id(), "polling connection created");
                // flush the first long-poll response (the open sequence)
                conn.polling_writer().await
            }
            Some("websocket") => ws::new_req(self.clone(), sid, req),
            _ => Err(Error::UnknownTransport),
        }
    }

    /// Create a channel over an accepted connection, send the open sequence,
    /// start its three loops and fire `"connection"`.
    pub(crate) async fn setup_event_loop(
        self: &Arc<Self>,
        conn: Arc<dyn Conn>,
        remote_addr: String,
        request_headers: HeaderMap,
    ) -> Result<Arc<Channel>, Error> {
        let (interval, timeout) = conn.ping_params();
        let header = ConnectionHeader {
            sid: sid::generate(&remote_addr),
            upgrades: vec!["websocket".to_owned()],
            ping_interval: interval.as_millis() as u64,
            ping_timeout: timeout.as_millis() as u64,
        };

        let channel = Channel::new(
            conn,
            self.handlers.clone(),
            Some(Arc::downgrade(self)),
            header,
            remote_addr,
            request_headers,
        );
        self.send_open_sequence(&channel).await?;
        channel.spawn_loops();
        self.handlers.call_loop_event(&channel, ON_CONNECTION);
        Ok(channel)
    }

    /// Transport upgrade: create the replacement websocket channel under the
    /// existing sid, wait until the probe exchange quiesced the remote's
    /// polling loop, then retire the old channel without a disconnection.
    pub(crate) async fn setup_upgrade_event_loop(
        self: &Arc<Self>,
        conn: Arc<dyn Conn>,
        remote_addr: String,
        request_headers: HeaderMap,
        sid: String,
    ) -> Result<(), Error> {
        let existing = self.get_channel(&sid)?;

        let (interval, timeout) = conn.ping_params();
        let header = ConnectionHeader {
            sid: sid.clone(),
            upgrades: Vec::new(),
            ping_interval: interval.as_millis() as u64,
            ping_timeout: timeout.as_millis() as u64,
        };
        let channel = Channel::new(
            conn,
            self.handlers.clone(),
            Some(Arc::downgrade(self)),
            header,
            remote_addr,
            request_headers,
        );
        channel.spawn_loops();
        self.sids.write().unwrap().insert(sid, channel.clone());

        // synchronize with the inbound loop observing `2probe`
        channel.upgraded_rx.recv_async().await.ok();
        existing.stub().await;
        Ok(())
    }

    /// Frame 1: `Open` with the JSON connection header. Frame 2: `Empty`,
    /// signalling the default namespace is ready.
    async fn send_open_sequence(&self, channel: &Arc<Channel>) -> Result<(), Error> {
        let mut open = Message::new(MessageType::Open);
        open.args = serde_json::to_string(&channel.header())?;
        channel.send_message(&open).await?;
        channel.send_message(&Message::new(MessageType::Empty)).await
    }
}

fn query_param(uri: &Uri, name: &str) -> Option<String> {
    uri.query()?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_owned())
    })
}

fn remote_addr<B>(req: &Request<B>) -> String {
    req.extensions()
        .get::<std::net::SocketAddr>()
        .map(|addr| addr.to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::channel::testing::MockConn;

    async fn connect_mock(server: &Arc<Server>) -> (Arc<Channel>, Arc<MockConn>) {
        let conn = MockConn::new(Duration::from_secs(60));
        let channel = server
            .setup_event_loop(conn.clone(), "10.0.0.1:9000".to_owned(), HeaderMap::new())
            .await
            .unwrap();
        // consume the open sequence
        let open = conn.next_written().await;
        assert!(open.starts_with('0'));
        assert_eq!(conn.next_written().await, "40");
        (channel, conn)
    }

    #[tokio::test]
    async fn connection_registers_sid() {
        let server = Server::new(Config::default());
        let (channel, _conn) = connect_mock(&server).await;

        assert_eq!(channel.id().len(), 20);
        assert_eq!(server.amount_of_sids(), 1);
        assert!(server.get_channel(&channel.id()).is_ok());
    }

    #[tokio::test]
    async fn broadcast_reaches_room_members_only() {
        let server = Server::new(Config::default());
        let (a, conn_a) = connect_mock(&server).await;
        let (b, conn_b) = connect_mock(&server).await;
        let (_c, conn_c) = connect_mock(&server).await;

        a.join("r").unwrap();
        b.join("r").unwrap();
        assert_eq!(server.amount("r"), 2);

        server.broadcast_to("r", "evt", &serde_json::json!({"x": 1}));
        assert_eq!(conn_a.next_written().await, r#"42["evt",{"x":1}]"#);
        assert_eq!(conn_b.next_written().await, r#"42["evt",{"x":1}]"#);
        assert!(conn_c.no_writes().await);
    }

    #[tokio::test]
    async fn broadcast_to_all_reaches_every_session() {
        let server = Server::new(Config::default());
        let (_a, conn_a) = connect_mock(&server).await;
        let (_b, conn_b) = connect_mock(&server).await;

        server.broadcast_to_all("tick", &1);
        assert_eq!(conn_a.next_written().await, r#"42["tick",1]"#);
        assert_eq!(conn_b.next_written().await, r#"42["tick",1]"#);
    }

    #[tokio::test]
    async fn disconnection_cleans_rooms_and_sids() {
        let server = Server::new(Config::default());
        let (a, _conn_a) = connect_mock(&server).await;
        let (b, _conn_b) = connect_mock(&server).await;

        a.join("r").unwrap();
        b.join("r").unwrap();

        a.close().await.unwrap();
        assert_eq!(server.amount_of_sids(), 1);
        assert_eq!(server.amount("r"), 1);
        assert!(server.get_channel(&a.id()).is_err());

        b.close().await.unwrap();
        assert_eq!(server.amount_of_rooms(), 0);
        assert_eq!(server.amount_of_sids(), 0);
    }

    #[tokio::test]
    async fn join_leave_roundtrip() {
        let server = Server::new(Config::default());
        let (a, _conn) = connect_mock(&server).await;

        a.join("r").unwrap();
        assert_eq!(a.amount("r"), 1);
        a.leave("r").unwrap();
        assert_eq!(a.amount("r"), 0);
        assert_eq!(server.amount_of_rooms(), 0);
    }

    #[test]
    fn query_params_are_extracted() {
        let uri: Uri = "http://x/socket.io/?EIO=3&transport=polling&sid=abc"
            .parse()
            .unwrap();
        assert_eq!(query_param(&uri, "transport").as_deref(), Some("polling"));
        assert_eq!(query_param(&uri, "sid").as_deref(), Some("abc"));
        assert_eq!(query_param(&uri, "nope"), None);
    }
}
