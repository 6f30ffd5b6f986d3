#![warn(
    clippy::all,
    clippy::todo,
    clippy::empty_enum,
    clippy::mem_forget,
    clippy::needless_continue,
    clippy::needless_borrow,
    clippy::if_let_mutex,
    clippy::await_holding_lock,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::inefficient_to_string,
    clippy::macro_use_imports,
    clippy::option_option,
    clippy::unnested_or_patterns,
    rust_2018_idioms,
    future_incompatible,
    nonstandard_style
)]
#![doc = include_str!("../Readme.md")]

pub mod body;
pub mod channel;
pub mod client;
pub mod config;
pub mod errors;
pub mod handler;
pub mod protocol;
pub mod server;
pub mod service;
pub mod transport;

mod ack;
mod rooms;
mod sid;

pub use channel::{amount_of_overflooded, Channel, ConnectionHeader, QUEUE_CAPACITY};
pub use client::{polling_url, websocket_url, Client};
pub use config::Config;
pub use errors::{Error, ProtocolError, TransportError};
pub use handler::{AckHandler, MessageHandler, ON_CONNECTION, ON_DISCONNECTION, ON_ERROR};
pub use protocol::{Message, MessageType};
pub use server::Server;
pub use service::{NotFoundService, SocketIoService};
