//! Connection registry: tunnel identity -> live agent session
//!
//! Holds at most one session per [`TunnelIdentity`]. Registering a second
//! session for an identity force-closes the first under the same shard lock,
//! so a lookup never observes two live sessions for one identity.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use neuralgate_proto::{TunnelIdentity, CLOSE_SESSION_REPLACED, REASON_SESSION_REPLACED};
use neuralgate_store::ClientId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

pub type SessionId = Uuid;

/// Frames queued for a session's socket writer
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Close { code: u16, reason: &'static str },
}

#[derive(Debug, Error, PartialEq)]
#[error("session {0} is closed")]
pub struct SessionClosed(pub SessionId);

/// One authenticated agent connection
///
/// The socket itself is owned by the connection task; the session holds the
/// writer queue and a token that stops the reader once the session is closed.
#[derive(Debug)]
pub struct AgentSession {
    id: SessionId,
    identity: TunnelIdentity,
    client_id: ClientId,
    connected_at: DateTime<Utc>,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    /// Set by the first `close`; later calls queue nothing
    closing: AtomicBool,
    closed: CancellationToken,
}

impl AgentSession {
    /// Create a session and the receiving end of its writer queue
    pub fn new(
        identity: TunnelIdentity,
        client_id: ClientId,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            identity,
            client_id,
            connected_at: Utc::now(),
            outbound,
            closing: AtomicBool::new(false),
            closed: CancellationToken::new(),
        });
        (session, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn identity(&self) -> &TunnelIdentity {
        &self.identity
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && !self.outbound.is_closed()
    }

    /// Resolves once the session has been closed from either side
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Queue a text frame for the agent
    pub fn send(&self, text: String) -> Result<(), SessionClosed> {
        if !self.is_open() {
            return Err(SessionClosed(self.id));
        }
        self.outbound
            .send(OutboundFrame::Text(text))
            .map_err(|_| SessionClosed(self.id))
    }

    /// Send a close frame and stop the session. Idempotent.
    pub fn close(&self, code: u16, reason: &'static str) {
        if self.closing.swap(true, Ordering::AcqRel) || self.closed.is_cancelled() {
            return;
        }
        // The writer drains the queue before it honours the token, so the
        // close frame is written even though the token fires right after.
        let _ = self.outbound.send(OutboundFrame::Close { code, reason });
        self.closed.cancel();
    }

    /// Mark the session closed without writing anything (peer already gone)
    pub fn shutdown(&self) {
        self.closed.cancel();
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<TunnelIdentity, Arc<AgentSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `session` for its identity, force-closing any prior session.
    ///
    /// Returns the superseded session, if there was one.
    pub fn register(&self, session: Arc<AgentSession>) -> Option<Arc<AgentSession>> {
        match self.sessions.entry(session.identity().clone()) {
            Entry::Occupied(mut occupied) => {
                let previous = occupied.insert(session.clone());
                previous.close(CLOSE_SESSION_REPLACED, REASON_SESSION_REPLACED);
                info!(
                    identity = %session.identity(),
                    old_session = %previous.id(),
                    new_session = %session.id(),
                    "Replaced existing agent session"
                );
                Some(previous)
            }
            Entry::Vacant(vacant) => {
                info!(
                    identity = %session.identity(),
                    session = %session.id(),
                    "Registered agent session"
                );
                vacant.insert(session);
                None
            }
        }
    }

    /// The live session for `identity`; closed sessions count as absent
    pub fn lookup(&self, identity: &TunnelIdentity) -> Option<Arc<AgentSession>> {
        self.sessions
            .get(identity)
            .filter(|session| session.is_open())
            .map(|session| Arc::clone(session.value()))
    }

    /// Remove the entry for `identity` only if it still belongs to `session_id`
    pub fn unregister(&self, identity: &TunnelIdentity, session_id: SessionId) -> bool {
        let removed = self
            .sessions
            .remove_if(identity, |_, session| session.id() == session_id)
            .is_some();

        if removed {
            info!(identity = %identity, session = %session_id, "Unregistered agent session");
        } else {
            debug!(
                identity = %identity,
                session = %session_id,
                "Skipped unregister for superseded session"
            );
        }

        removed
    }

    /// Close every registered session, returning how many were open
    pub fn close_all(&self, code: u16, reason: &'static str) -> usize {
        let mut closed = 0;
        for entry in self.sessions.iter() {
            if entry.value().is_open() {
                entry.value().close(code, reason);
                closed += 1;
            }
        }
        closed
    }

    /// Number of identities with an open session
    pub fn online(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().is_open())
            .count()
    }
}
