//! Event handler registration and dispatch.
//!
//! Handlers are registered by event name with one of two callable shapes:
//! channel only, or channel plus a payload deserialized into the type the
//! callback declares. [`Handlers::on`] registers fire-and-forget handlers,
//! [`Handlers::on_ack`] registers handlers whose return value answers an
//! incoming ack request.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::channel::Channel;
use crate::protocol::{Message, MessageType};

/// Synthetic event fired when a session is established.
pub const ON_CONNECTION: &str = "connection";
/// Synthetic event fired when a session is torn down.
pub const ON_DISCONNECTION: &str = "disconnection";
/// Conventional event name for error reporting between peers.
pub const ON_ERROR: &str = "error";

/// A handler shape accepted by [`Handlers::on`]: `Fn(&Arc<Channel>)` or
/// `Fn(&Arc<Channel>, T)` with `T: DeserializeOwned`.
///
/// The marker type parameter distinguishes the two arities; it is always
/// inferred at the registration site.
pub trait MessageHandler<T>: Send + Sync + 'static {
    fn call(&self, channel: &Arc<Channel>, args: &str) -> Result<(), serde_json::Error>;
}

impl<F> MessageHandler<()> for F
where
    F: Fn(&Arc<Channel>) + Send + Sync + 'static,
{
    fn call(&self, channel: &Arc<Channel>, _args: &str) -> Result<(), serde_json::Error> {
        self(channel);
        Ok(())
    }
}

impl<F, T> MessageHandler<(T,)> for F
where
    F: Fn(&Arc<Channel>, T) + Send + Sync + 'static,
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn call(&self, channel: &Arc<Channel>, args: &str) -> Result<(), serde_json::Error> {
        let payload: T = serde_json::from_str(args)?;
        self(channel, payload);
        Ok(())
    }
}

/// A handler shape accepted by [`Handlers::on_ack`]: the same two arities as
/// [`MessageHandler`], returning a `R: Serialize` that answers the ack
/// request which triggered the handler.
pub trait AckHandler<T>: Send + Sync + 'static {
    fn call(&self, channel: &Arc<Channel>, args: &str) -> Result<Value, serde_json::Error>;
}

impl<F, R> AckHandler<((), R)> for F
where
    F: Fn(&Arc<Channel>) -> R + Send + Sync + 'static,
    R: Serialize + Send + Sync + 'static,
{
    fn call(&self, channel: &Arc<Channel>, _args: &str) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self(channel))
    }
}

impl<F, T, R> AckHandler<((T,), R)> for F
where
    F: Fn(&Arc<Channel>, T) -> R + Send + Sync + 'static,
    T: DeserializeOwned + Send + Sync + 'static,
    R: Serialize + Send + Sync + 'static,
{
    fn call(&self, channel: &Arc<Channel>, args: &str) -> Result<Value, serde_json::Error> {
        let payload: T = serde_json::from_str(args)?;
        serde_json::to_value(self(channel, payload))
    }
}

type BoxedMessageHandler =
    Box<dyn Fn(&Arc<Channel>, &str) -> Result<(), serde_json::Error> + Send + Sync>;
type BoxedAckHandler =
    Box<dyn Fn(&Arc<Channel>, &str) -> Result<Value, serde_json::Error> + Send + Sync>;

/// An erased registered handler. The variant records whether the callable
/// produces a value, which decides how ack requests are treated.
pub(crate) enum Registered {
    Message(BoxedMessageHandler),
    Ack(BoxedAckHandler),
}

pub(crate) type SystemHandler = Box<dyn Fn(&Arc<Channel>) + Send + Sync>;

/// The event registry of a server or client: event name to erased handler,
/// plus the single-slot system handlers used for session bookkeeping.
#[derive(Default)]
pub(crate) struct Handlers {
    events: RwLock<HashMap<String, Arc<Registered>>>,
    on_connection: RwLock<Option<SystemHandler>>,
    on_disconnection: RwLock<Option<SystemHandler>>,
}

impl Handlers {
    /// Bind a fire-and-forget handler to an event name.
    pub(crate) fn on<T, H: MessageHandler<T>>(&self, name: impl Into<String>, handler: H) {
        let erased = Registered::Message(Box::new(move |c, args| handler.call(c, args)));
        self.events
            .write()
            .unwrap()
            .insert(name.into(), Arc::new(erased));
    }

    /// Bind a value-producing handler to an event name.
    pub(crate) fn on_ack<T, H: AckHandler<T>>(&self, name: impl Into<String>, handler: H) {
        let erased = Registered::Ack(Box::new(move |c, args| handler.call(c, args)));
        self.events
            .write()
            .unwrap()
            .insert(name.into(), Arc::new(erased));
    }

    pub(crate) fn set_system(&self, on_connection: SystemHandler, on_disconnection: SystemHandler) {
        *self.on_connection.write().unwrap() = Some(on_connection);
        *self.on_disconnection.write().unwrap() = Some(on_disconnection);
    }

    fn find(&self, name: &str) -> Option<Arc<Registered>> {
        self.events.read().unwrap().get(name).cloned()
    }

    /// Fire a lifecycle event: the system handler first, then a user handler
    /// registered under the same name, if any.
    pub(crate) fn call_loop_event(&self, channel: &Arc<Channel>, event: &str) {
        if event == ON_CONNECTION {
            if let Some(system) = &*self.on_connection.read().unwrap() {
                system(channel);
            }
        }
        if event == ON_DISCONNECTION {
            if let Some(system) = &*self.on_disconnection.read().unwrap() {
                system(channel);
            }
        }

        let Some(handler) = self.find(event) else {
            tracing::trace!(event, "no user handler for lifecycle event");
            return;
        };
        let result = match &*handler {
            Registered::Message(f) => f(channel, "null"),
            Registered::Ack(f) => f(channel, "null").map(|_| ()),
        };
        if let Err(err) = result {
            tracing::warn!(event, %err, "lifecycle handler payload decode failed");
        }
    }

    /// Hand an inbound message to the matching handler.
    ///
    /// Runs on a dispatch task spawned by the inbound loop, so user code
    /// never blocks frame decoding. Payload decode failures are logged and
    /// the frame is dropped; the channel stays alive.
    pub(crate) async fn dispatch(&self, channel: Arc<Channel>, msg: Message) {
        match msg.kind {
            MessageType::Emit => {
                let Some(handler) = self.find(&msg.event) else {
                    tracing::trace!(event = %msg.event, "no handler registered");
                    return;
                };
                let result = match &*handler {
                    Registered::Message(f) => f(&channel, &msg.args),
                    Registered::Ack(f) => f(&channel, &msg.args).map(|_| ()),
                };
                if let Err(err) = result {
                    tracing::warn!(event = %msg.event, %err, "dropping frame: bad payload");
                }
            }
            MessageType::AckRequest => {
                let Some(handler) = self.find(&msg.event) else {
                    return;
                };
                // Handlers that produce no value ignore ack requests.
                let Registered::Ack(f) = &*handler else {
                    return;
                };
                match f(&channel, &msg.args) {
                    Ok(value) => {
                        let mut response = Message::ack_response(msg.ack_id);
                        response.args = value.to_string();
                        if let Err(err) = channel.send_message(&response).await {
                            tracing::warn!(ack_id = msg.ack_id, %err, "ack response not sent");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(event = %msg.event, %err, "dropping ack request: bad payload");
                    }
                }
            }
            MessageType::AckResponse => {
                if channel.resolve_ack(msg.ack_id, msg.args).is_err() {
                    tracing::trace!(ack_id = msg.ack_id, "ack response without waiter, dropped");
                }
            }
            _ => {}
        }
    }
}
