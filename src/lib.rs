//! Bayeux Hub - publish/subscribe server core for Bayeux/CometD clients
//!
//! Clients connect over a WebSocket or by long-polling, handshake, subscribe
//! to topic channels and publish JSON messages to each other.
//!
//! ## Architecture
//!
//! ```text
//! Client ──► http (WS upgrade | POST) ──► Session ──► Server (router) ──► handlers
//!                                          ▲                                │
//!                                          └──── mailbox ◄── ChannelRegistry ◄┘
//! ```
//!
//! - [`channel`]: topic registry and fan-out
//! - [`session`]: one connected peer, its mailbox and delivery loop
//! - [`server`]: client directory, handler table and meta-protocol handlers
//!
//! ## Environment Variables
//!
//! See [`config`]: `BAYEUX_LISTEN`, `BAYEUX_PATH`,
//! `BAYEUX_CONNECT_INTERVAL_MS`, `BAYEUX_POLL_TIMEOUT_MS`,
//! `BAYEUX_POLL_IDLE_MULTIPLIER`, `BAYEUX_DISPATCH_WORKERS`.

pub mod bayeux;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod http;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

pub use bayeux::{Advice, Message, MetaChannel, Reconnect};
pub use channel::{Channel, ChannelRegistry, DeliveryFn, Subscriber};
pub use config::{Config, ConfigError};
pub use dispatch::{Dispatch, Spawn, WorkerPool};
pub use protocol::{Envelope, ProtocolError, RawMessage};
pub use server::{DispatchError, Handler, HandlerFn, Server};
pub use session::{Mailbox, Session, SessionError, SessionState, TransportKind};
pub use transport::{BatchReader, BatchWriter, Responder, TransportError};
