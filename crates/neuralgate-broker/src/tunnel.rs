//! Agent WebSocket endpoint: `GET /tunnel?username=..&slug=..&key=..`
//!
//! Session states: connecting -> authenticated -> closed. Credentials are
//! checked after the upgrade so a rejected agent sees a 1008 close frame
//! rather than a bare HTTP error.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use neuralgate_proto::{
    AgentReply, ConnectParams, CLOSE_POLICY_VIOLATION, REASON_INVALID_CREDENTIALS,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::registry::{AgentSession, OutboundFrame};
use crate::server::AppState;
use crate::verifier::{Verified, VerifyError};

/// How long a finished session waits for its writer to flush a close frame
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn tunnel_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<ConnectParams>,
) -> Response {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state, params))
}

async fn authenticate(state: &AppState, params: ConnectParams) -> Result<Verified, VerifyError> {
    let (identity, key) = params.into_parts()?;
    state
        .verifier
        .verify(&identity.account, &identity.slug, &key)
        .await
}

async fn handle_agent_socket(socket: WebSocket, state: Arc<AppState>, params: ConnectParams) {
    let (mut sink, mut stream) = socket.split();

    let verified = match authenticate(&state, params).await {
        Ok(verified) => verified,
        Err(e) => {
            warn!(error = %e, "Agent connection rejected");
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_POLICY_VIOLATION,
                    reason: REASON_INVALID_CREDENTIALS.into(),
                })))
                .await;
            return;
        }
    };

    let (session, mut outbound) = AgentSession::new(verified.identity.clone(), verified.client_id);
    state.registry.register(session.clone());
    state.stats.session_opened(session.id(), verified.client_id);
    info!(identity = %verified.identity, session = %session.id(), "Hardware online");

    let writer_session = session.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                frame = outbound.recv() => match frame {
                    Some(OutboundFrame::Text(text)) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(OutboundFrame::Close { code, reason }) => {
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                    None => break,
                },
                _ = writer_session.closed() => break,
            }
        }
    });

    loop {
        let message = tokio::select! {
            message = stream.next() => match message {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    debug!(session = %session.id(), error = %e, "Agent socket error");
                    break;
                }
                None => break,
            },
            _ = session.closed() => break,
        };

        match message {
            Message::Text(text) => handle_reply(&state, &session, text.as_str()),
            Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                Ok(text) => handle_reply(&state, &session, text),
                Err(_) => warn!(session = %session.id(), "Ignoring non UTF-8 binary frame"),
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    session.shutdown();
    state.registry.unregister(session.identity(), session.id());
    let abandoned = state.correlator.abandon_session(session.id());
    state.stats.session_closed(session.id());

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        debug!(session = %session.id(), "Writer did not finish in time");
    }

    info!(
        identity = %session.identity(),
        session = %session.id(),
        abandoned,
        "Hardware offline"
    );
}

fn handle_reply(state: &AppState, session: &AgentSession, text: &str) {
    let reply = match AgentReply::from_json(text) {
        Ok(reply) => reply,
        Err(e) => {
            warn!(session = %session.id(), error = %e, "Malformed agent message");
            return;
        }
    };

    if let Some(meta) = state.correlator.resolve(session.id(), reply) {
        state
            .stats
            .request_completed(meta.client_id, meta.model.clone(), meta.elapsed_ms());
    }
}
