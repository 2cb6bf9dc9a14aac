//! Request correlator: requestId -> waiting HTTP caller
//!
//! Each in-flight passthrough request owns a one-shot settlement channel.
//! The entry is settled by whichever of {agent reply, timeout, agent gone}
//! removes it from the map first; `DashMap::remove` is the only exclusivity
//! point, so no request is ever answered twice.

use dashmap::DashMap;
use neuralgate_proto::{AgentReply, RequestId};
use neuralgate_store::ClientId;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::registry::SessionId;

/// How a pending request ended
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Replied(AgentReply),
    TimedOut,
    /// The owning agent session closed before replying
    AgentGone,
}

/// Bookkeeping carried with each pending request
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub client_id: ClientId,
    pub session_id: SessionId,
    pub model: String,
    pub started_at: Instant,
}

impl RequestMeta {
    pub fn new(client_id: ClientId, session_id: SessionId, model: impl Into<String>) -> Self {
        Self {
            client_id,
            session_id,
            model: model.into(),
            started_at: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> i64 {
        i64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(i64::MAX)
    }
}

struct PendingEntry {
    responder: oneshot::Sender<Settlement>,
    meta: RequestMeta,
}

#[derive(Clone)]
pub struct Correlator {
    pending: Arc<DashMap<RequestId, PendingEntry>>,
    timeout: Duration,
}

impl Correlator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            timeout,
        }
    }

    /// Register a pending request. The returned handle must be awaited for
    /// the outcome; dropping it discards the entry.
    pub fn create(&self, request_id: RequestId, meta: RequestMeta) -> PendingRequest {
        let (responder, rx) = oneshot::channel();
        let previous = self
            .pending
            .insert(request_id.clone(), PendingEntry { responder, meta });
        if previous.is_some() {
            warn!(request_id = %request_id, "Request id reused while still pending");
        }

        PendingRequest {
            request_id,
            rx,
            pending: self.pending.clone(),
            timeout: self.timeout,
        }
    }

    /// Settle the request a reply belongs to.
    ///
    /// Only requests dispatched over `session_id` can be settled by it.
    /// Returns the request metadata if this call settled it, `None` if the id
    /// is unknown, foreign, or was already settled.
    pub fn resolve(&self, session_id: SessionId, reply: AgentReply) -> Option<RequestMeta> {
        let Some((request_id, entry)) = self
            .pending
            .remove_if(&reply.request_id, |_, entry| entry.meta.session_id == session_id)
        else {
            debug!(request_id = %reply.request_id, "Dropping reply for unknown request");
            return None;
        };

        if entry.responder.send(Settlement::Replied(reply)).is_err() {
            debug!(request_id = %request_id, "Caller went away before reply arrived");
        }
        Some(entry.meta)
    }

    /// Settle every request still waiting on `session_id` with [`Settlement::AgentGone`]
    pub fn abandon_session(&self, session_id: SessionId) -> usize {
        let orphaned: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|entry| entry.meta.session_id == session_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut settled = 0;
        for request_id in orphaned {
            if let Some((_, entry)) = self
                .pending
                .remove_if(&request_id, |_, entry| entry.meta.session_id == session_id)
            {
                let _ = entry.responder.send(Settlement::AgentGone);
                settled += 1;
            }
        }

        if settled > 0 {
            debug!(session = %session_id, settled, "Abandoned pending requests");
        }
        settled
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Caller-side handle for one pending request
pub struct PendingRequest {
    request_id: RequestId,
    rx: oneshot::Receiver<Settlement>,
    pending: Arc<DashMap<RequestId, PendingEntry>>,
    timeout: Duration,
}

impl PendingRequest {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the settlement, timing out after the correlator's ceiling
    pub async fn settle(mut self) -> Settlement {
        match tokio::time::timeout(self.timeout, &mut self.rx).await {
            Ok(Ok(settlement)) => settlement,
            Ok(Err(_)) => Settlement::AgentGone,
            Err(_) => {
                if self.pending.remove(&self.request_id).is_some() {
                    warn!(request_id = %self.request_id, "Request timed out");
                    return Settlement::TimedOut;
                }
                // A reply removed the entry first and has already been sent
                match (&mut self.rx).await {
                    Ok(settlement) => settlement,
                    Err(_) => Settlement::TimedOut,
                }
            }
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if self.pending.remove(&self.request_id).is_some() {
            debug!(request_id = %self.request_id, "Discarded pending request");
        }
    }
}
