//! Client session management
//!
//! A session represents one connected peer, whatever transport carries it.
//! It owns the peer's identity, the names of the channels it is subscribed
//! to, and an outgoing mailbox drained by its own delivery loop.
//!
//! Lifecycle: `Open -> Closing -> Closed`. Closing unsubscribes from every
//! held channel, leaves the server directory, releases the transport and
//! finally wakes anyone blocked in [`Session::wait`]. The wake-up comes from
//! the delivery loop once it has let go of the transport; local sessions
//! have no transport and wake waiters from `close` itself.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span, warn};

use crate::bayeux::Message;
use crate::channel::{DeliveryFn, Subscriber};
use crate::protocol::{self, Envelope};
use crate::server::Server;
use crate::transport::{BatchReader, BatchWriter, Responder, TransportError};

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Outgoing messages waiting for the delivery loop
pub type Mailbox = mpsc::UnboundedReceiver<Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

/// Transport variant behind a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// In-process peer reading the mailbox directly
    Local,
    /// Persistent socket, e.g. WebSocket
    Duplex,
    /// One HTTP request per delivery
    Poll,
}

/// Receiving ends handed to whichever loop drives the session
pub(crate) struct Outbound {
    pub(crate) mailbox: Mailbox,
    pub(crate) polls: Option<mpsc::UnboundedReceiver<Responder>>,
}

/// Server-side representative of one connected client
pub struct Session {
    id: String,
    kind: TransportKind,
    server: Weak<Server>,
    /// Names of subscribed channels; the registry owns the channels
    channels: Mutex<HashSet<String>>,
    mailbox: mpsc::UnboundedSender<Message>,
    /// Hand-off for poll responders (poll sessions only)
    polls: Option<mpsc::UnboundedSender<Responder>>,
    state: AtomicU8,
    /// Tells the loops to release the transport
    shutdown: CancellationToken,
    /// Fired once the transport is released
    closed: CancellationToken,
    span: Span,
}

impl Session {
    pub(crate) fn new(
        id: String,
        kind: TransportKind,
        server: Weak<Server>,
        parent: &Span,
    ) -> (Arc<Self>, Outbound) {
        let (mailbox, mailbox_rx) = mpsc::unbounded_channel();
        let (polls, polls_rx) = match kind {
            TransportKind::Poll => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Some(tx), Some(rx))
            }
            TransportKind::Local | TransportKind::Duplex => (None, None),
        };
        let span = info_span!(parent: parent, "session", client_id = %id, transport = ?kind);

        let session = Arc::new(Self {
            id,
            kind,
            server,
            channels: Mutex::new(HashSet::new()),
            mailbox,
            polls,
            state: AtomicU8::new(OPEN),
            shutdown: CancellationToken::new(),
            closed: CancellationToken::new(),
            span,
        });

        (
            session,
            Outbound {
                mailbox: mailbox_rx,
                polls: polls_rx,
            },
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn state(&self) -> SessionState {
        match self.state.load(Ordering::Acquire) {
            OPEN => SessionState::Open,
            CLOSING => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Subscribed channel names
    pub fn channels(&self) -> Vec<String> {
        self.channels.lock().iter().cloned().collect()
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.channels.lock().contains(channel)
    }

    /// Queue a message for delivery. Never waits on I/O.
    pub fn send(&self, message: Message) {
        if self.state() == SessionState::Closed {
            debug!(client_id = %self.id, channel = message.channel(), "session closed, dropping message");
            return;
        }
        if self.mailbox.send(message).is_err() {
            debug!(client_id = %self.id, "mailbox gone, dropping message");
        }
    }

    /// Delivery callback for channel subscriptions
    ///
    /// Holds the session weakly so the registry never keeps it alive.
    pub fn delivery(self: &Arc<Self>) -> DeliveryFn {
        let session = Arc::downgrade(self);
        Arc::new(move |message| {
            if let Some(session) = session.upgrade() {
                session.send(message);
            }
        })
    }

    /// Forward one envelope body to the server for routing
    pub fn on_message(&self, channel: String, payload: Vec<u8>) {
        match self.server.upgrade() {
            Some(server) => server.on_receive_message(channel, self.id.clone(), payload),
            None => debug!(client_id = %self.id, channel, "server gone, dropping message"),
        }
    }

    /// Hand each envelope of a decoded frame to the server as its own unit
    /// of work
    pub fn ingest(self: &Arc<Self>, envelopes: Vec<Envelope>) {
        let Some(server) = self.server.upgrade() else {
            debug!(client_id = %self.id, "server gone, dropping frame");
            return;
        };

        for envelope in envelopes {
            let session = Arc::clone(self);
            server.dispatch().deliver(Box::pin(
                async move { session.on_message(envelope.channel, envelope.payload) }
                    .instrument(self.span.clone()),
            ));
        }
    }

    /// Give a poll session the responder of a fresh HTTP request
    pub fn offer_poll(&self, responder: Responder) -> Result<(), SessionError> {
        let polls = self.polls.as_ref().ok_or(SessionError::NotPolling)?;
        if !self.is_open() {
            return Err(SessionError::Closed);
        }
        polls.send(responder).map_err(|_| SessionError::Closed)
    }

    /// Close the session. Safe to call any number of times.
    pub fn close(&self) {
        if self
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(client_id = %self.id, "session already closing");
            return;
        }

        let _enter = self.span.enter();
        let held = self.channels();

        if let Some(server) = self.server.upgrade() {
            for name in &held {
                if let Some(channel) = server.channels().get(name) {
                    channel.remove_subscription(self);
                }
            }
            server.unregister_client(&self.id);
        }
        self.channels.lock().clear();

        self.shutdown.cancel();
        self.state.store(CLOSED, Ordering::Release);
        if self.kind == TransportKind::Local {
            self.closed.cancel();
        }

        info!(client_id = %self.id, channels = held.len(), "session closed");
    }

    /// Wait until the session is closed
    pub async fn wait(&self) {
        self.closed.cancelled().await
    }

    pub(crate) fn start_duplex<R, W>(self: &Arc<Self>, outbound: Outbound, reader: R, writer: W)
    where
        R: BatchReader + 'static,
        W: BatchWriter + 'static,
    {
        tokio::spawn(
            Arc::clone(self)
                .ingest_loop(reader)
                .instrument(self.span.clone()),
        );
        tokio::spawn(
            Arc::clone(self)
                .duplex_outbound_loop(outbound.mailbox, writer)
                .instrument(self.span.clone()),
        );
    }

    /// Start poll delivery. With `idle` set, the session closes itself when
    /// no poll request arrives for that long.
    pub(crate) fn start_poll(self: &Arc<Self>, outbound: Outbound, idle: Option<Duration>) {
        let Some(polls) = outbound.polls else {
            warn!(client_id = %self.id, "poll loop started without poll hand-off");
            self.close();
            self.closed.cancel();
            return;
        };
        tokio::spawn(
            Arc::clone(self)
                .poll_outbound_loop(outbound.mailbox, polls, idle)
                .instrument(self.span.clone()),
        );
    }

    async fn ingest_loop<R: BatchReader>(self: Arc<Self>, mut reader: R) {
        loop {
            let batch = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                batch = reader.receive_batch() => batch,
            };

            match batch {
                Ok(envelopes) => self.ingest(envelopes),
                Err(TransportError::Closed) => {
                    debug!("transport closed by peer");
                    self.close();
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "receive failed");
                    self.close();
                    break;
                }
            }
        }
        debug!("ingestion loop stopped");
    }

    async fn duplex_outbound_loop<W: BatchWriter>(self: Arc<Self>, mut mailbox: Mailbox, mut writer: W) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    let rest = drain(&mut mailbox);
                    if !rest.is_empty() && let Err(e) = writer.send_batch(&rest).await {
                        debug!(error = %e, "final flush failed");
                    }
                    break;
                }
                next = mailbox.recv() => {
                    let Some(first) = next else { break };
                    let mut batch = vec![first];
                    batch.extend(drain(&mut mailbox));

                    if let Err(e) = writer.send_batch(&batch).await {
                        warn!(error = %e, "send failed");
                        self.close();
                        break;
                    }
                }
            }
        }

        self.close();
        writer.close().await;
        self.closed.cancel();
        debug!("delivery loop stopped");
    }

    async fn poll_outbound_loop(
        self: Arc<Self>,
        mailbox: Mailbox,
        polls: mpsc::UnboundedReceiver<Responder>,
        idle: Option<Duration>,
    ) {
        self.deliver_polls(mailbox, polls, idle).await;
        self.close();
        self.closed.cancel();
        debug!("poll delivery loop stopped");
    }

    async fn deliver_polls(
        &self,
        mut mailbox: Mailbox,
        mut polls: mpsc::UnboundedReceiver<Responder>,
        idle: Option<Duration>,
    ) {
        let mut pending: Option<Responder> = None;
        // Drained but undelivered because the request went away mid-reply
        let mut carry: Vec<Message> = Vec::new();

        loop {
            let mut responder = match pending.take() {
                Some(responder) => responder,
                None => tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break,
                    next = polls.recv() => match next {
                        Some(responder) => responder,
                        None => break,
                    },
                    _ = idle_timer(idle) => {
                        info!(idle_ms = idle.map_or(0, |d| d.as_millis() as u64), "no poll request in time, expiring session");
                        self.close();
                        break;
                    }
                },
            };

            if responder.is_closed() {
                debug!("skipping abandoned poll request");
                continue;
            }

            if !carry.is_empty() {
                match self.respond(responder, &carry) {
                    Ok(()) => carry.clear(),
                    Err(TransportError::Abandoned) => {}
                    Err(e) => {
                        warn!(error = %e, "poll response failed");
                        self.close();
                        return;
                    }
                }
                continue;
            }

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    pending = Some(responder);
                    break;
                }
                _ = responder.closed() => {
                    debug!("poll request abandoned while waiting");
                }
                newer = polls.recv() => {
                    // Only the newest request is held open
                    match newer {
                        Some(newer) => {
                            let _ = self.respond(responder, &[]);
                            pending = Some(newer);
                        }
                        None => {
                            pending = Some(responder);
                            break;
                        }
                    }
                }
                next = mailbox.recv() => {
                    let Some(first) = next else { break };
                    let mut batch = vec![first];
                    batch.extend(drain(&mut mailbox));

                    match self.respond(responder, &batch) {
                        Ok(()) => {}
                        Err(TransportError::Abandoned) => {
                            debug!(messages = batch.len(), "poll request gone, holding batch");
                            carry = batch;
                        }
                        Err(e) => {
                            warn!(error = %e, "poll response failed");
                            self.close();
                            return;
                        }
                    }
                }
            }
        }

        if self.shutdown.is_cancelled() {
            let responder = pending.or_else(|| polls.try_recv().ok());
            if let Some(responder) = responder {
                carry.extend(drain(&mut mailbox));
                if let Err(e) = self.respond(responder, &carry) {
                    debug!(error = %e, "final flush failed");
                }
            }
        }
    }

    fn respond(&self, responder: Responder, batch: &[Message]) -> Result<(), TransportError> {
        let frame = protocol::encode_batch(batch)?;
        responder.respond(frame.into_bytes())
    }
}

/// Resolves after `idle`, or never when unset
async fn idle_timer(idle: Option<Duration>) {
    match idle {
        Some(idle) => tokio::time::sleep(idle).await,
        None => std::future::pending().await,
    }
}

fn drain(mailbox: &mut Mailbox) -> Vec<Message> {
    let mut batch = Vec::new();
    while let Ok(message) = mailbox.try_recv() {
        batch.push(message);
    }
    batch
}

impl Subscriber for Session {
    fn id(&self) -> &str {
        &self.id
    }

    fn on_subscribe(&self, channel: &str) {
        self.channels.lock().insert(channel.to_string());
    }

    fn on_unsubscribe(&self, channel: &str) {
        self.channels.lock().remove(channel);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("channels", &self.channels.lock().len())
            .finish()
    }
}

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("session does not use a polling transport")]
    NotPolling,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bayeux;
    use crate::config::Config;
    use crate::transport::testing;
    use serde_json::Value;

    fn server() -> Arc<Server> {
        Server::new(Config::default(), Span::none())
    }

    async fn next_frame(peer: &mut testing::Peer) -> Vec<Value> {
        tokio::time::timeout(Duration::from_secs(5), peer.outbound.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("transport closed")
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let server = server();
        let (session, _mailbox) = server.connect_local();
        let channel = server.channels().get_or_create("/chat/room1");
        channel.add_subscription(&*session, session.delivery());
        assert!(session.is_subscribed("/chat/room1"));

        session.close();
        session.close();

        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.channels().is_empty());
        assert_eq!(channel.subscriber_count(), 0);
        assert!(server.get_client(session.id()).is_none());
        tokio::time::timeout(Duration::from_secs(1), session.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_after_close_is_dropped() {
        let server = server();
        let (session, mut mailbox) = server.connect_local();
        session.close();
        session.send(bayeux::publish_ack("/chat", ""));
        assert!(mailbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplex_handshake_over_transport() {
        let server = server();
        let (reader, writer, mut peer) = testing::pair();
        let session = server.connect_duplex(reader, writer);
        assert!(server.get_client(session.id()).is_some());

        peer.send(r#"[{"channel":"/meta/handshake","version":"1.0","supportedConnectionTypes":["websocket"],"id":"1"}]"#);
        let frame = next_frame(&mut peer).await;

        assert_eq!(frame.len(), 1);
        assert_eq!(frame[0]["channel"], "/meta/handshake");
        assert_eq!(frame[0]["successful"], true);
        assert_eq!(frame[0]["clientId"], session.id());
        assert_eq!(frame[0]["id"], "1");
    }

    #[tokio::test]
    async fn test_mailbox_order_is_preserved() {
        let server = server();
        let (reader, writer, mut peer) = testing::pair();
        let session = server.connect_duplex(reader, writer);

        for i in 0..20 {
            session.send(bayeux::publish_ack("/chat", &i.to_string()));
        }

        let mut ids = Vec::new();
        while ids.len() < 20 {
            for message in next_frame(&mut peer).await {
                ids.push(message["id"].as_str().unwrap().to_string());
            }
        }
        let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_transport_close_closes_session() {
        let server = server();
        let (reader, writer, peer) = testing::pair();
        let session = server.connect_duplex(reader, writer);
        server
            .channels()
            .get_or_create("/chat/room1")
            .add_subscription(&*session, session.delivery());

        drop(peer);
        tokio::time::timeout(Duration::from_secs(5), session.wait())
            .await
            .unwrap();

        assert!(server.get_client(session.id()).is_none());
        assert_eq!(
            server.channels().get("/chat/room1").unwrap().subscriber_count(),
            0
        );
    }

    #[tokio::test]
    async fn test_bad_frame_closes_session() {
        let server = server();
        let (reader, writer, peer) = testing::pair();
        let session = server.connect_duplex(reader, writer);

        peer.send(r#"{"channel":"/meta/handshake"}"#);
        tokio::time::timeout(Duration::from_secs(5), session.wait())
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_close_flushes_pending_messages() {
        let server = server();
        let (reader, writer, mut peer) = testing::pair();
        let session = server.connect_duplex(reader, writer);

        session.send(bayeux::publish_ack("/chat", "last"));
        session.close();

        let frame = next_frame(&mut peer).await;
        assert_eq!(frame[0]["id"], "last");
    }

    #[tokio::test]
    async fn test_wait_returns_after_transport_released() {
        use std::sync::atomic::AtomicBool;

        struct SlowRelease {
            inner: testing::MemoryWriter,
            released: Arc<AtomicBool>,
        }

        #[async_trait::async_trait]
        impl BatchWriter for SlowRelease {
            async fn send_batch(&mut self, batch: &[Message]) -> Result<(), TransportError> {
                self.inner.send_batch(batch).await
            }

            async fn close(&mut self) {
                tokio::time::sleep(Duration::from_millis(50)).await;
                self.released.store(true, Ordering::SeqCst);
            }
        }

        let server = server();
        let (reader, writer, _peer) = testing::pair();
        let released = Arc::new(AtomicBool::new(false));
        let session = server.connect_duplex(
            reader,
            SlowRelease {
                inner: writer,
                released: released.clone(),
            },
        );

        session.close();
        tokio::time::timeout(Duration::from_secs(5), session.wait())
            .await
            .unwrap();
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_quiet_poll_session_expires() {
        let config = Config {
            poll_timeout: Duration::from_millis(50),
            poll_idle_multiplier: 2,
            ..Config::default()
        };
        let server = Server::new(config, Span::none());
        let session = server.connect_poll();
        server
            .channels()
            .get_or_create("/news")
            .add_subscription(&*session, session.delivery());

        tokio::time::timeout(Duration::from_secs(5), session.wait())
            .await
            .unwrap();
        assert!(server.get_client(session.id()).is_none());
        assert_eq!(server.channels().get("/news").unwrap().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_polling_client_is_kept_alive() {
        let config = Config {
            poll_timeout: Duration::from_millis(50),
            poll_idle_multiplier: 2,
            ..Config::default()
        };
        let server = Server::new(config, Span::none());
        let session = server.connect_poll();

        // Re-poll well inside the 100ms idle window
        for _ in 0..6 {
            let (responder, response) = Responder::new();
            session.offer_poll(responder).unwrap();
            tokio::time::sleep(Duration::from_millis(40)).await;
            drop(response);
        }
        assert!(session.is_open());
        assert!(server.get_client(session.id()).is_some());
    }

    #[tokio::test]
    async fn test_poll_delivery_waits_for_request() {
        let server = server();
        let session = server.connect_poll();

        session.send(bayeux::publish_ack("/chat", "1"));
        session.send(bayeux::publish_ack("/chat", "2"));

        let (responder, response) = Responder::new();
        session.offer_poll(responder).unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), response)
            .await
            .unwrap()
            .unwrap();
        let frame: Vec<Value> = serde_json::from_slice(&frame).unwrap();
        assert!(!frame.is_empty());
        assert_eq!(frame[0]["id"], "1");
    }

    #[tokio::test]
    async fn test_newer_poll_releases_older() {
        let server = server();
        let session = server.connect_poll();

        let (first, first_response) = Responder::new();
        session.offer_poll(first).unwrap();
        let (second, second_response) = Responder::new();
        session.offer_poll(second).unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), first_response)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, b"[]");

        session.send(bayeux::publish_ack("/chat", "x"));
        let frame = tokio::time::timeout(Duration::from_secs(5), second_response)
            .await
            .unwrap()
            .unwrap();
        let frame: Vec<Value> = serde_json::from_slice(&frame).unwrap();
        assert_eq!(frame[0]["id"], "x");
    }

    #[tokio::test]
    async fn test_abandoned_poll_is_skipped() {
        let server = server();
        let session = server.connect_poll();

        let (stale, stale_response) = Responder::new();
        drop(stale_response);
        session.offer_poll(stale).unwrap();

        let (fresh, fresh_response) = Responder::new();
        session.offer_poll(fresh).unwrap();
        session.send(bayeux::publish_ack("/chat", "y"));

        let frame = tokio::time::timeout(Duration::from_secs(5), fresh_response)
            .await
            .unwrap()
            .unwrap();
        let frame: Vec<Value> = serde_json::from_slice(&frame).unwrap();
        assert_eq!(frame[0]["id"], "y");
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn test_offer_poll_rejected_for_other_transports() {
        let server = server();
        let (session, _mailbox) = server.connect_local();
        let (responder, _response) = Responder::new();
        assert!(matches!(
            session.offer_poll(responder),
            Err(SessionError::NotPolling)
        ));

        let poll = server.connect_poll();
        poll.close();
        let (responder, _response) = Responder::new();
        assert!(matches!(poll.offer_poll(responder), Err(SessionError::Closed)));
    }
}
