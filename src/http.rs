//! HTTP front end
//!
//! One route carries both transports: `GET` upgrades to a WebSocket and
//! becomes a duplex session, `POST` is a long-poll request. A poll request
//! attaches to the session named by the clientId of its envelopes, or opens a
//! new poll session when it carries a handshake.

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tracing::{debug, info, warn};

use crate::bayeux::{self, Message};
use crate::protocol::{self, Envelope};
use crate::server::Server;
use crate::session::{Session, SessionError};
use crate::transport::{self, Responder};

/// Build the router serving the configured Bayeux path
pub fn router(server: Arc<Server>) -> Router {
    let path = server.config().path.clone();
    Router::new()
        .route(&path, get(websocket).post(long_poll))
        .with_state(server)
}

/// WebSocket upgrade handler
async fn websocket(ws: WebSocketUpgrade, State(server): State<Arc<Server>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, server))
}

async fn handle_socket(socket: WebSocket, server: Arc<Server>) {
    let (reader, writer) = transport::split_websocket(socket);
    let session = server.connect_duplex(reader, writer);
    info!(client_id = session.id(), "WebSocket client connected");

    session.wait().await;
    debug!(client_id = session.id(), "WebSocket client gone");
}

/// Long-polling handler
async fn long_poll(State(server): State<Arc<Server>>, body: Bytes) -> Response {
    let envelopes = match protocol::decode_batch(&body) {
        Ok(envelopes) => envelopes,
        Err(e) => {
            warn!(error = %e, "rejecting poll request");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let Some(session) = resolve_session(&server, &envelopes) else {
        debug!(envelopes = envelopes.len(), "poll request from unknown client");
        return json_frame(&unknown_client_replies(&envelopes));
    };

    let (responder, response) = Responder::new();
    match session.offer_poll(responder) {
        Ok(()) => {}
        Err(SessionError::NotPolling) => {
            debug!(client_id = session.id(), transport = ?session.kind(), "poll request for non-poll session");
            let replies: Vec<Message> = envelopes
                .iter()
                .map(|envelope| bayeux::connection_type_mismatch(&envelope.channel, envelope.id.clone()))
                .collect();
            return json_frame(&replies);
        }
        Err(e @ SessionError::Closed) => {
            debug!(client_id = session.id(), error = %e, "poll session unavailable");
            return json_frame(&unknown_client_replies(&envelopes));
        }
    }
    session.ingest(envelopes);

    let frame = match tokio::time::timeout(server.config().poll_timeout, response).await {
        Ok(Ok(frame)) => frame,
        // Timed out, or released without a reply
        Ok(Err(_)) | Err(_) => b"[]".to_vec(),
    };

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        frame,
    )
        .into_response()
}

/// Find the poll session a request belongs to
///
/// A request without a known clientId may only open a new session by
/// handshaking.
fn resolve_session(server: &Arc<Server>, envelopes: &[Envelope]) -> Option<Arc<Session>> {
    let known = envelopes
        .iter()
        .filter_map(|envelope| envelope.client_id.as_deref())
        .find_map(|client_id| server.get_client(client_id));
    if let Some(session) = known {
        return Some(session);
    }

    envelopes
        .iter()
        .any(|envelope| envelope.channel == bayeux::META_HANDSHAKE)
        .then(|| server.connect_poll())
}

fn unknown_client_replies(envelopes: &[Envelope]) -> Vec<Message> {
    envelopes
        .iter()
        .map(|envelope| bayeux::unknown_client(&envelope.channel, envelope.id.clone()))
        .collect()
}

fn json_frame(messages: &[Message]) -> Response {
    match protocol::encode_batch(messages) {
        Ok(frame) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            frame,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
