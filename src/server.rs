//! Protocol dispatcher
//!
//! Owns the client directory, the channel registry and the handler table.
//! Sessions push `(channel, client id, payload)` tuples in through
//! [`Server::on_receive_message`]; a router task picks them up and runs the
//! matching handler as its own unit of work.
//!
//! ## Routing
//!
//! | Path | Handler |
//! |------|---------|
//! | `/meta/handshake` .. `/meta/unsubscribe` | built-in meta handlers |
//! | registered with [`Server::handle_func`] | custom handler |
//! | any existing topic channel | publish |
//! | anything else | dropped |

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::bayeux::{
    self, ConnectRequest, DisconnectRequest, HandshakeRequest, Message, MetaChannel,
    SubscribeRequest, UnsubscribeRequest,
};
use crate::channel::ChannelRegistry;
use crate::config::Config;
use crate::dispatch::{self, Dispatch};
use crate::protocol::{ProtocolError, RawMessage};
use crate::session::{Mailbox, Session, TransportKind};
use crate::transport::{BatchReader, BatchWriter};

/// Application handler for a channel path
pub type HandlerFn = Arc<dyn Fn(&Arc<Server>, RawMessage) -> Result<(), DispatchError> + Send + Sync>;

/// What runs for a routed message
#[derive(Clone)]
pub enum Handler {
    Meta(MetaChannel),
    /// Broadcast to the channel's subscribers
    Publish,
    Custom(HandlerFn),
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Meta(meta) => f.debug_tuple("Meta").field(meta).finish(),
            Handler::Publish => f.write_str("Publish"),
            Handler::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Bayeux server core
pub struct Server {
    config: Config,
    /// Client directory: client id -> session
    clients: Mutex<HashMap<String, Arc<Session>>>,
    handlers: DashMap<String, Handler>,
    channels: ChannelRegistry,
    dispatch: Arc<dyn Dispatch>,
    incoming: mpsc::UnboundedSender<RawMessage>,
    shutdown: CancellationToken,
    span: Span,
}

impl Server {
    /// Create a server and start its router
    ///
    /// Every session and task spawned by the server logs under `span`.
    /// Must be called from within a Tokio runtime.
    pub fn new(config: Config, span: Span) -> Arc<Self> {
        let dispatch = dispatch::from_workers(config.dispatch_workers);
        let (incoming, incoming_rx) = mpsc::unbounded_channel();

        let server = Arc::new(Self {
            config,
            clients: Mutex::new(HashMap::new()),
            handlers: DashMap::new(),
            channels: ChannelRegistry::new(dispatch.clone()),
            dispatch,
            incoming,
            shutdown: CancellationToken::new(),
            span,
        });

        for meta in MetaChannel::ALL {
            server
                .handlers
                .insert(meta.path().to_string(), Handler::Meta(meta));
        }

        tokio::spawn(
            route_loop(
                Arc::downgrade(&server),
                incoming_rx,
                server.shutdown.clone(),
            )
            .instrument(server.span.clone()),
        );

        server
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    pub(crate) fn dispatch(&self) -> &Arc<dyn Dispatch> {
        &self.dispatch
    }

    /// Register an application handler for a channel path
    pub fn handle_func<F>(&self, path: &str, handler: F)
    where
        F: Fn(&Arc<Server>, RawMessage) -> Result<(), DispatchError> + Send + Sync + 'static,
    {
        self.handlers
            .insert(path.to_string(), Handler::Custom(Arc::new(handler)));
        debug!(path, "handler registered");
    }

    /// Resolve the handler for a channel path
    ///
    /// Topic channels without an explicit handler get the publish handler.
    pub fn handler(&self, path: &str) -> Option<Handler> {
        if let Some(handler) = self.handlers.get(path) {
            return Some(handler.clone());
        }
        self.channels.contains(path).then_some(Handler::Publish)
    }

    // -----------------------------------------------------------------------
    // Directory
    // -----------------------------------------------------------------------

    pub fn register_client(&self, id: String, session: Arc<Session>) {
        debug!(client_id = %id, "client registered");
        self.clients.lock().insert(id, session);
    }

    pub fn unregister_client(&self, id: &str) -> Option<Arc<Session>> {
        let removed = self.clients.lock().remove(id);
        if removed.is_some() {
            debug!(client_id = id, "client unregistered");
        }
        removed
    }

    pub fn get_client(&self, id: &str) -> Option<Arc<Session>> {
        self.clients.lock().get(id).cloned()
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Open a session over a duplex transport
    ///
    /// The session is in the directory before its loops start reading.
    pub fn connect_duplex<R, W>(self: &Arc<Self>, reader: R, writer: W) -> Arc<Session>
    where
        R: BatchReader + 'static,
        W: BatchWriter + 'static,
    {
        let (session, outbound) = self.open_session(TransportKind::Duplex);
        session.start_duplex(outbound, reader, writer);
        session
    }

    /// Open a session fed by poll requests
    pub fn connect_poll(self: &Arc<Self>) -> Arc<Session> {
        let (session, outbound) = self.open_session(TransportKind::Poll);
        session.start_poll(outbound, self.config.poll_idle_timeout());
        session
    }

    /// Open an in-process session; the caller drains its mailbox
    pub fn connect_local(self: &Arc<Self>) -> (Arc<Session>, Mailbox) {
        let (session, outbound) = self.open_session(TransportKind::Local);
        (session, outbound.mailbox)
    }

    fn open_session(self: &Arc<Self>, kind: TransportKind) -> (Arc<Session>, crate::session::Outbound) {
        let id = bayeux::generate_client_id();
        let (session, outbound) = Session::new(id.clone(), kind, Arc::downgrade(self), &self.span);
        self.register_client(id, session.clone());
        info!(client_id = session.id(), transport = ?kind, "session opened");
        (session, outbound)
    }

    // -----------------------------------------------------------------------
    // Messaging
    // -----------------------------------------------------------------------

    /// Queue an inbound message for routing
    pub fn on_receive_message(&self, channel: String, client_id: String, payload: Vec<u8>) {
        let raw = RawMessage {
            channel,
            client_id,
            payload,
        };
        if let Err(e) = self.incoming.send(raw) {
            debug!(channel = %e.0.channel, "router stopped, dropping message");
        }
    }

    /// Publish a message to every subscriber of a channel
    pub fn publish(&self, channel: &str, message: Message) {
        self.channels.publish(channel, message);
    }

    /// Stop routing and close every session. Idempotent.
    pub fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let sessions: Vec<Arc<Session>> = self.clients.lock().values().cloned().collect();
        for session in &sessions {
            session.close();
        }
        info!(sessions = sessions.len(), "server closed");
    }

    /// Route one message to its handler and report the outcome
    pub fn route_incoming(self: &Arc<Self>, raw: RawMessage) {
        let channel = raw.channel.clone();
        let client_id = raw.client_id.clone();

        let result = match self.handler(&raw.channel) {
            Some(handler) => self.invoke(handler, raw),
            None => Err(DispatchError::NoHandler(channel.clone())),
        };

        match result {
            Ok(()) => {}
            Err(e @ DispatchError::UnknownClient { .. }) => {
                error!(%channel, %client_id, error = %e, "session missing from directory, handler aborted");
            }
            Err(e @ DispatchError::NoHandler(_)) => {
                warn!(%channel, %client_id, error = %e, "dropping message");
            }
            Err(e) => {
                warn!(%channel, %client_id, error = %e, "handler failed");
            }
        }
    }

    fn invoke(self: &Arc<Self>, handler: Handler, raw: RawMessage) -> Result<(), DispatchError> {
        match handler {
            Handler::Meta(MetaChannel::Handshake) => self.handshake(raw),
            Handler::Meta(MetaChannel::Connect) => self.connect(raw),
            Handler::Meta(MetaChannel::Disconnect) => self.disconnect(raw),
            Handler::Meta(MetaChannel::Subscribe) => self.subscribe(raw),
            Handler::Meta(MetaChannel::Unsubscribe) => self.unsubscribe(raw),
            Handler::Publish => self.publish_message(raw),
            Handler::Custom(handler) => handler(self, raw),
        }
    }

    /// Session lookup for handlers that cannot run without one
    fn require_client(&self, raw: &RawMessage) -> Result<Arc<Session>, DispatchError> {
        self.get_client(&raw.client_id)
            .ok_or_else(|| DispatchError::UnknownClient {
                channel: raw.channel.clone(),
                client_id: raw.client_id.clone(),
            })
    }

    // -----------------------------------------------------------------------
    // Meta handlers
    // -----------------------------------------------------------------------

    fn handshake(&self, raw: RawMessage) -> Result<(), DispatchError> {
        let request: HandshakeRequest = bayeux::parse_request(&raw.payload)?;
        let session = self.require_client(&raw)?;

        debug!(
            client_id = session.id(),
            version = ?request.version,
            connection_types = ?request.supported_connection_types,
            "handshake"
        );
        session.send(bayeux::handshake_response(&request, session.id()));
        Ok(())
    }

    fn connect(&self, raw: RawMessage) -> Result<(), DispatchError> {
        let request: ConnectRequest = bayeux::parse_request(&raw.payload)?;
        let session = self.require_client(&raw)?;

        debug!(client_id = session.id(), connection_type = ?request.connection_type, "connect");
        session.send(bayeux::connect_response(
            &request,
            session.id(),
            self.config.connect_interval_ms,
        ));
        Ok(())
    }

    fn disconnect(&self, raw: RawMessage) -> Result<(), DispatchError> {
        let request: DisconnectRequest = bayeux::parse_request(&raw.payload)?;
        let Some(session) = self.get_client(&raw.client_id) else {
            debug!(client_id = %raw.client_id, "disconnect for unknown client");
            return Ok(());
        };

        // Queued first so the closing flush carries it to the peer
        session.send(bayeux::disconnect_response(&request, session.id()));
        session.close();
        debug!(client_id = session.id(), "disconnected");
        Ok(())
    }

    fn subscribe(&self, raw: RawMessage) -> Result<(), DispatchError> {
        let request: SubscribeRequest = bayeux::parse_request(&raw.payload)?;
        let session = self.require_client(&raw)?;

        if bayeux::is_meta(&request.subscription) {
            warn!(client_id = session.id(), subscription = %request.subscription, "refused meta subscription");
            let error = format!("403:{}:meta channel", request.subscription);
            session.send(bayeux::subscribe_refused(&request, session.id(), error));
            return Ok(());
        }

        let channel = self.channels.get_or_create(&request.subscription);
        channel.add_subscription(&*session, session.delivery());
        if !session.is_open() {
            // Closed while subscribing; its cleanup may have missed this channel
            channel.remove_subscription(&*session);
            return Ok(());
        }

        session.send(bayeux::subscribe_response(&request, session.id()));
        channel.publish(bayeux::welcome_event(channel.name(), session.id()));
        Ok(())
    }

    fn unsubscribe(&self, raw: RawMessage) -> Result<(), DispatchError> {
        let request: UnsubscribeRequest = bayeux::parse_request(&raw.payload)?;
        let session = self.require_client(&raw)?;

        if let Some(channel) = self.channels.get(&request.subscription) {
            channel.remove_subscription(&*session);
        }
        session.send(bayeux::unsubscribe_response(&request, session.id()));
        Ok(())
    }

    fn publish_message(&self, raw: RawMessage) -> Result<(), DispatchError> {
        let Some(session) = self.get_client(&raw.client_id) else {
            debug!(channel = %raw.channel, client_id = %raw.client_id, "publish from unknown client");
            return Ok(());
        };

        let payload: Map<String, Value> = bayeux::parse_request(&raw.payload)?;
        let id = payload
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        session.send(bayeux::publish_ack(&raw.channel, &id));

        let event = bayeux::publish_event(&raw.channel, payload);
        match self.channels.get(&raw.channel) {
            Some(channel) => {
                channel.publish_excluding(event, session.id());
            }
            None => debug!(channel = %raw.channel, "publish to unknown channel"),
        }
        Ok(())
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("clients", &self.client_count())
            .field("channels", &self.channels.len())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Pull routed messages off the queue until shutdown
async fn route_loop(
    server: Weak<Server>,
    mut incoming: mpsc::UnboundedReceiver<RawMessage>,
    shutdown: CancellationToken,
) {
    loop {
        let raw = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = incoming.recv() => match next {
                Some(raw) => raw,
                None => break,
            },
        };

        let Some(server) = server.upgrade() else { break };
        let dispatch = server.dispatch.clone();
        dispatch.deliver(Box::pin(
            async move { server.route_incoming(raw) }.instrument(Span::current()),
        ));
    }
    debug!("router stopped");
}

/// Dispatcher errors
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to decode request: {0}")]
    Decode(#[from] ProtocolError),
    #[error("client {client_id} on {channel} is not in the directory")]
    UnknownClient { channel: String, client_id: String },
    #[error("no handler for {0}")]
    NoHandler(String),
}
