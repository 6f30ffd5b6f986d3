//! A [`Channel`] is a live per-connection session: one transport connection
//! plus three cooperating tasks driven by a bounded outbound queue.
//!
//! * the inbound loop reads frames, decodes them and hands events to the
//!   dispatcher on transient tasks,
//! * the outbound loop drains the queue onto the transport and watches its
//!   depth,
//! * the keepalive loop enqueues ping frames at the transport interval.
//!
//! Any loop may decide to close the channel: transport read error, decode
//! error, outbound stall or write error. [`Channel::close`] is idempotent.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, RwLock, Weak};
use std::time::Duration;

use http::HeaderMap;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::ack::PendingAcks;
use crate::errors::Error;
use crate::handler::{Handlers, ON_CONNECTION, ON_DISCONNECTION};
use crate::protocol::{
    self, Message, MessageType, CLOSE_MESSAGE, PING_MESSAGE, PING_PROBE, PONG_MESSAGE, PONG_PROBE,
    STUB_MESSAGE,
};
use crate::server::Server;
use crate::transport::{Conn, STOP_MESSAGE};

/// Capacity of the outbound queue. Ping, emit, ack and terminal frames all
/// share it; the outbound loop treats a queue at capacity − 1 as a stall and
/// closes the channel.
pub const QUEUE_CAPACITY: usize = 500;

/// Header exempted from the forwarded-address lookup of [`Channel::ip`].
const HEADER_FORWARD: &str = "X-Forwarded-For";

/// Channels whose outbound queue is above half capacity. Purely
/// observational, see [`amount_of_overflooded`].
static OVERFLOODED: LazyLock<Mutex<HashSet<u64>>> = LazyLock::new(Mutex::default);

static NEXT_CHANNEL_KEY: AtomicU64 = AtomicU64::new(1);

/// Number of channels whose outbound queue has crossed half capacity.
pub fn amount_of_overflooded() -> usize {
    OVERFLOODED.lock().unwrap().len()
}

/// The engine.io handshake header: sent by the server as the payload of the
/// first `Open` frame, consumed by the client on receipt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHeader {
    pub sid: String,
    pub upgrades: Vec<String>,
    /// Milliseconds.
    pub ping_interval: u64,
    /// Milliseconds.
    pub ping_timeout: u64,
}

/// A live connection. Obtained from connection handlers on the server side
/// or from [`Client::connect`](crate::client::Client::connect) on the client
/// side; always handled through an [`Arc`].
pub struct Channel {
    key: u64,
    conn: Arc<dyn Conn>,

    out_tx: flume::Sender<String>,
    out_rx: flume::Receiver<String>,
    stub_tx: flume::Sender<()>,
    pub(crate) stub_rx: flume::Receiver<()>,
    upgraded_tx: flume::Sender<()>,
    pub(crate) upgraded_rx: flume::Receiver<()>,

    header: RwLock<ConnectionHeader>,
    alive: Mutex<bool>,
    acks: PendingAcks,
    handlers: Arc<Handlers>,

    server: Option<Weak<Server>>,
    remote_addr: String,
    request_headers: HeaderMap,
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for Channel {}
impl Hash for Channel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.key);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("sid", &self.id())
            .field("alive", &self.is_alive())
            .field("queued", &self.out_tx.len())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(
        conn: Arc<dyn Conn>,
        handlers: Arc<Handlers>,
        server: Option<Weak<Server>>,
        header: ConnectionHeader,
        remote_addr: String,
        request_headers: HeaderMap,
    ) -> Arc<Self> {
        let (out_tx, out_rx) = flume::bounded(QUEUE_CAPACITY);
        let (stub_tx, stub_rx) = flume::bounded(1);
        let (upgraded_tx, upgraded_rx) = flume::bounded(1);

        Arc::new(Self {
            key: NEXT_CHANNEL_KEY.fetch_add(1, Ordering::Relaxed),
            conn,
            out_tx,
            out_rx,
            stub_tx,
            stub_rx,
            upgraded_tx,
            upgraded_rx,
            header: RwLock::new(header),
            alive: Mutex::new(true),
            acks: PendingAcks::default(),
            handlers,
            server,
            remote_addr,
            request_headers,
        })
    }

    /// The session id of this connection, stable across a transport upgrade.
    pub fn id(&self) -> String {
        self.header.read().unwrap().sid.clone()
    }

    /// The connection header negotiated at session start.
    pub fn header(&self) -> ConnectionHeader {
        self.header.read().unwrap().clone()
    }

    pub fn is_alive(&self) -> bool {
        *self.alive.lock().unwrap()
    }

    /// The remote address, preferring `X-Forwarded-For` when present.
    pub fn ip(&self) -> String {
        self.request_headers
            .get(HEADER_FORWARD)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .unwrap_or_else(|| self.remote_addr.clone())
    }

    /// Headers of the HTTP request that established this connection.
    pub fn request_headers(&self) -> &HeaderMap {
        &self.request_headers
    }

    fn server(&self) -> Result<Arc<Server>, Error> {
        self.server
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(Error::ServerNotSet)
    }

    /// Fire-and-forget an event to the remote.
    pub async fn emit<T: Serialize + ?Sized>(&self, event: &str, payload: &T) -> Result<(), Error> {
        let mut msg = Message::emit(event);
        msg.args = serialize_payload(payload)?;
        self.send_message(&msg).await
    }

    /// Emit an event and await the remote handler's answer within `timeout`.
    /// The answer is the opaque JSON carried by the ack response.
    pub async fn ack<T: Serialize + ?Sized>(
        &self,
        event: &str,
        payload: &T,
        timeout: Duration,
    ) -> Result<String, Error> {
        let id = self.acks.next_id();
        let (tx, rx) = oneshot::channel();
        self.acks.register(id, tx);

        let mut msg = Message::ack_request(event, id);
        msg.args = serialize_payload(payload)?;
        if let Err(err) = self.send_message(&msg).await {
            self.acks.unregister(id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) | Err(_) => {
                self.acks.unregister(id);
                Err(Error::SendTimeout)
            }
        }
    }

    /// Encode and enqueue a message whose `args` are already serialized.
    pub(crate) async fn send_message(&self, msg: &Message) -> Result<(), Error> {
        let frame = protocol::encode(msg)?;
        self.send_raw(frame).await
    }

    /// Enqueue a raw frame. Fails fast with [`Error::SocketOverflood`] when
    /// the queue is already saturated, otherwise suspends until a slot frees.
    pub(crate) async fn send_raw(&self, frame: String) -> Result<(), Error> {
        if self.out_tx.len() >= QUEUE_CAPACITY {
            return Err(Error::SocketOverflood);
        }
        self.out_tx
            .send_async(frame)
            .await
            .map_err(|_| Error::SocketOverflood)
    }

    pub(crate) fn resolve_ack(&self, id: u64, args: String) -> Result<(), Error> {
        self.acks.resolve(id, args)
    }

    /// Join a named room on the owning server.
    pub fn join(self: &Arc<Self>, room: &str) -> Result<(), Error> {
        self.server()?.rooms().join(room, self);
        Ok(())
    }

    /// Leave a named room on the owning server.
    pub fn leave(self: &Arc<Self>, room: &str) -> Result<(), Error> {
        self.server()?.rooms().leave(room, self);
        Ok(())
    }

    /// Number of channels currently joined to `room`.
    pub fn amount(&self, room: &str) -> usize {
        self.server().map(|s| s.amount(room)).unwrap_or(0)
    }

    /// Snapshot of the channels currently joined to `room`.
    pub fn list(&self, room: &str) -> Vec<Arc<Channel>> {
        self.server().map(|s| s.list(room)).unwrap_or_default()
    }

    /// Broadcast an event to every channel of `room` on the owning server.
    pub fn broadcast_to<T: Serialize>(&self, room: &str, event: &str, payload: &T) {
        if let Ok(server) = self.server() {
            server.broadcast_to(room, event, payload);
        }
    }

    /// Close the connection. Idempotent; fires `"disconnection"` once.
    pub async fn close(self: &Arc<Self>) -> Result<(), Error> {
        self.close_channel(true).await;
        Ok(())
    }

    /// Retire the connection without a `"disconnection"` event. Used to
    /// quiesce the old polling channel once a websocket upgrade completed.
    pub(crate) async fn stub(self: &Arc<Self>) {
        if self.close_channel(false).await {
            // the outbound loop acknowledges the stub sentinel on its way out
            tokio::time::timeout(Duration::from_secs(1), self.stub_rx.recv_async())
                .await
                .ok();
        }
    }

    /// The close sequence: flip the alive flag, close the transport, drain
    /// the outbound queue and post exactly one terminal sentinel. At most one
    /// caller ever gets past the flag, so a channel sees at most one sentinel
    /// in its lifetime. Returns whether this call performed the close.
    async fn close_channel(self: &Arc<Self>, dispatch: bool) -> bool {
        {
            let mut alive = self.alive.lock().unwrap();
            if !*alive {
                return false;
            }
            *alive = false;
        }

        if let Err(err) = self.conn.close().await {
            tracing::trace!(sid = %self.id(), %err, "transport close");
        }

        while self.out_rx.try_recv().is_ok() {}
        let sentinel = if dispatch { CLOSE_MESSAGE } else { STUB_MESSAGE };
        self.out_tx.try_send(sentinel.to_owned()).ok();

        if dispatch {
            self.handlers.call_loop_event(self, ON_DISCONNECTION);
        }

        OVERFLOODED.lock().unwrap().remove(&self.key);
        true
    }

    /// Start the three tasks of this channel.
    pub(crate) fn spawn_loops(self: &Arc<Self>) {
        let c = self.clone();
        tokio::spawn(async move { c.in_loop().await });
        let c = self.clone();
        tokio::spawn(async move { c.out_loop().await });
        let c = self.clone();
        tokio::spawn(async move { c.ping_loop().await });
    }

    /// Inbound loop: read, decode, route.
    async fn in_loop(self: Arc<Self>) {
        loop {
            let frame = match self.conn.get_message().await {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::debug!(sid = %self.id(), %err, "inbound read failed, closing");
                    self.close_channel(true).await;
                    return;
                }
            };

            if frame == STOP_MESSAGE {
                // the transport was quiesced externally
                return;
            }

            let msg = match protocol::decode(&frame) {
                Ok(msg) => msg,
                Err(err) => {
                    tracing::debug!(sid = %self.id(), %err, "undecodable frame, closing");
                    self.close_channel(true).await;
                    return;
                }
            };

            match msg.kind {
                MessageType::Open => {
                    let header: ConnectionHeader = match serde_json::from_str(&msg.args) {
                        Ok(header) => header,
                        Err(err) => {
                            tracing::debug!(%err, "malformed connection header, closing");
                            self.close_channel(true).await;
                            return;
                        }
                    };
                    *self.header.write().unwrap() = header;
                    self.handlers.call_loop_event(&self, ON_CONNECTION);
                }
                MessageType::Ping => {
                    if msg.source == PING_PROBE {
                        self.send_raw(PONG_PROBE.to_owned()).await.ok();
                        self.upgraded_tx.try_send(()).ok();
                    } else {
                        self.send_raw(PONG_MESSAGE.to_owned()).await.ok();
                    }
                }
                MessageType::Upgrade | MessageType::Blank | MessageType::Pong => {}
                _ => {
                    // user code must never block the inbound loop
                    let channel = self.clone();
                    let handlers = self.handlers.clone();
                    tokio::spawn(async move { handlers.dispatch(channel, msg).await });
                }
            }
        }
    }

    /// Outbound loop: watch queue depth, dequeue, write.
    async fn out_loop(self: Arc<Self>) {
        loop {
            let queued = self.out_tx.len();
            if queued >= QUEUE_CAPACITY - 1 {
                tracing::warn!(sid = %self.id(), queued, "outbound queue stalled, closing");
                self.close_channel(true).await;
                return;
            } else if queued > QUEUE_CAPACITY / 2 {
                OVERFLOODED.lock().unwrap().insert(self.key);
            } else {
                OVERFLOODED.lock().unwrap().remove(&self.key);
            }

            let frame = match self.out_rx.recv_async().await {
                Ok(frame) => frame,
                Err(_) => return,
            };

            if frame == CLOSE_MESSAGE {
                return;
            }
            if frame == STUB_MESSAGE {
                self.stub_tx.try_send(()).ok();
                return;
            }

            if let Err(err) = self.conn.write_message(frame).await {
                tracing::debug!(sid = %self.id(), %err, "outbound write failed, closing");
                self.close_channel(true).await;
                return;
            }
        }
    }

    /// Keepalive loop: enqueue a ping every transport interval while the
    /// channel is alive.
    async fn ping_loop(self: Arc<Self>) {
        loop {
            let (interval, _) = self.conn.ping_params();
            tokio::time::sleep(interval).await;
            if !self.is_alive() {
                return;
            }
            if self.send_raw(PING_MESSAGE.to_owned()).await.is_err() {
                return;
            }
        }
    }
}

fn serialize_payload<T: Serialize + ?Sized>(payload: &T) -> Result<String, Error> {
    serde_json::to_string(payload).map_err(|err| {
        tracing::warn!(%err, "payload serialization failed, frame not enqueued");
        err.into()
    })
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::testing::*;
    use super::*;

    fn counting_handlers() -> (Arc<Handlers>, Arc<AtomicUsize>) {
        let handlers = Arc::new(Handlers::default());
        let disconnections = Arc::new(AtomicUsize::new(0));
        let count = disconnections.clone();
        handlers.set_system(
            Box::new(|_c| {}),
            Box::new(move |_c| {
                count.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (handlers, disconnections)
    }

    #[tokio::test]
    async fn probe_ping_enqueues_pong_probe_and_signals_upgrade() {
        let (channel, conn) = mock_channel();

        conn.feed(PING_PROBE);
        assert_eq!(conn.next_written().await, PONG_PROBE);
        tokio::time::timeout(Duration::from_secs(1), channel.upgraded_rx.recv_async())
            .await
            .expect("upgrade signal not posted")
            .unwrap();
        // posted exactly once
        assert!(channel.upgraded_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn plain_ping_enqueues_pong() {
        let (_channel, conn) = mock_channel();
        conn.feed(PING_MESSAGE);
        assert_eq!(conn.next_written().await, PONG_MESSAGE);
    }

    #[tokio::test]
    async fn ping_loop_enqueues_pings() {
        let (handlers, _) = counting_handlers();
        let (_channel, conn) = testing::mock_channel_with(Duration::from_millis(30), handlers);
        assert_eq!(conn.next_written().await, PING_MESSAGE);
        assert_eq!(conn.next_written().await, PING_MESSAGE);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (handlers, disconnections) = counting_handlers();
        let (channel, conn) = testing::mock_channel_with(Duration::from_secs(60), handlers);

        channel.close().await.unwrap();
        channel.close().await.unwrap();
        assert!(!channel.is_alive());
        assert!(conn.is_closed());
        assert_eq!(disconnections.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn read_error_closes_with_disconnection() {
        let (handlers, disconnections) = counting_handlers();
        let (channel, conn) = testing::mock_channel_with(Duration::from_secs(60), handlers);

        conn.feed_error();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!channel.is_alive());
        assert_eq!(disconnections.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn undecodable_frame_closes() {
        let (handlers, disconnections) = counting_handlers();
        let (channel, conn) = testing::mock_channel_with(Duration::from_secs(60), handlers);

        conn.feed("zzz");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!channel.is_alive());
        assert_eq!(disconnections.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stub_skips_disconnection() {
        let (handlers, disconnections) = counting_handlers();
        let (channel, conn) = testing::mock_channel_with(Duration::from_secs(60), handlers);

        channel.stub().await;
        assert_eq!(disconnections.load(Ordering::SeqCst), 0);
        assert!(!channel.is_alive());
        // the stub sentinel retired the outbound loop without touching the wire
        assert!(conn.no_writes().await);
    }

    #[tokio::test]
    async fn at_most_one_sentinel_per_lifetime() {
        let (handlers, disconnections) = counting_handlers();
        let (channel, _conn) = testing::mock_channel_with(Duration::from_secs(60), handlers);

        channel.close().await.unwrap();
        channel.stub().await;
        assert_eq!(disconnections.load(Ordering::SeqCst), 1);
        // the stub sentinel was never posted: the close sentinel won
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(channel.stub_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_fails_fast_on_saturated_queue() {
        // no loops: the queue is never drained
        let conn = MockConn::new(Duration::from_secs(60));
        let channel = Channel::new(
            conn,
            Arc::new(Handlers::default()),
            None,
            ConnectionHeader::default(),
            String::new(),
            HeaderMap::new(),
        );

        for i in 0..QUEUE_CAPACITY {
            channel.send_raw(format!("frame-{i}")).await.unwrap();
        }
        assert!(matches!(
            channel.send_raw("one-too-many".to_owned()).await,
            Err(Error::SocketOverflood)
        ));
    }

    #[tokio::test]
    async fn emit_serializes_payload() {
        let (channel, conn) = mock_channel();
        channel
            .emit("chat", &serde_json::json!({"msg": "hi"}))
            .await
            .unwrap();
        assert_eq!(conn.next_written().await, r#"42["chat",{"msg":"hi"}]"#);
    }

    #[tokio::test]
    async fn ack_times_out_and_unregisters() {
        let (channel, conn) = mock_channel();
        let err = channel
            .ack("slow", &(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SendTimeout));
        // the request frame itself went out
        assert_eq!(conn.next_written().await, r#"421["slow",null]"#);
        // a late response is dropped silently
        assert!(channel.resolve_ack(1, "\"late\"".to_owned()).is_err());
    }

    #[tokio::test]
    async fn ack_resolves_with_remote_answer() {
        let (channel, conn) = mock_channel();
        let fut = channel.ack("sum", &[1, 2, 3], Duration::from_secs(1));
        let channel2 = channel.clone();
        tokio::spawn(async move {
            // answer as soon as the request is on the wire
            let written = conn.next_written().await;
            assert_eq!(written, r#"421["sum",[1,2,3]]"#);
            channel2.resolve_ack(1, "6".to_owned()).unwrap();
        });
        assert_eq!(fut.await.unwrap(), "6");
    }

    #[tokio::test]
    async fn server_ops_without_server_fail() {
        let (channel, _conn) = mock_channel();
        assert!(matches!(channel.join("r"), Err(Error::ServerNotSet)));
        assert!(matches!(channel.leave("r"), Err(Error::ServerNotSet)));
        assert_eq!(channel.amount("r"), 0);
        assert!(channel.list("r").is_empty());
    }
}
