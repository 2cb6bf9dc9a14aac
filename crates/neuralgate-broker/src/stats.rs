//! Write-behind session and request logging
//!
//! The data path only ever pushes a [`StatEvent`] onto an unbounded channel.
//! A single worker drains it into the [`Datastore`]; failures and writes that
//! exceed the write ceiling are logged and dropped, never retried and never
//! surfaced to callers or agents.

use chrono::{DateTime, Utc};
use neuralgate_store::{ClientId, ConnectionLogId, Datastore, StoreError};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::registry::SessionId;

#[derive(Debug, Clone, PartialEq)]
pub enum StatEvent {
    SessionOpened {
        session_id: SessionId,
        client_id: ClientId,
        at: DateTime<Utc>,
    },
    SessionClosed {
        session_id: SessionId,
        at: DateTime<Utc>,
    },
    RequestCompleted {
        client_id: ClientId,
        model: String,
        duration_ms: i64,
    },
    LastSeenIp {
        client_id: ClientId,
        ip: String,
    },
}

/// Sending half handed to the data path
#[derive(Debug, Clone)]
pub struct StatsLogger {
    tx: mpsc::UnboundedSender<StatEvent>,
}

impl StatsLogger {
    /// Start the worker. It exits once every logger clone has been dropped.
    ///
    /// Each datastore write is abandoned after `write_timeout`, so a stalled
    /// datastore delays the queue by at most that much per event.
    pub fn spawn(store: Arc<dyn Datastore>, write_timeout: Duration) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(store, write_timeout, rx));
        (Self { tx }, worker)
    }

    /// A logger whose events go nowhere
    pub fn disabled() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    /// A logger that hands events to the caller instead of a datastore
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StatEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn record(&self, event: StatEvent) {
        if self.tx.send(event).is_err() {
            debug!("Stats worker stopped; event dropped");
        }
    }

    pub fn session_opened(&self, session_id: SessionId, client_id: ClientId) {
        self.record(StatEvent::SessionOpened {
            session_id,
            client_id,
            at: Utc::now(),
        });
    }

    pub fn session_closed(&self, session_id: SessionId) {
        self.record(StatEvent::SessionClosed {
            session_id,
            at: Utc::now(),
        });
    }

    pub fn request_completed(&self, client_id: ClientId, model: String, duration_ms: i64) {
        self.record(StatEvent::RequestCompleted {
            client_id,
            model,
            duration_ms,
        });
    }

    pub fn last_seen_ip(&self, client_id: ClientId, ip: String) {
        self.record(StatEvent::LastSeenIp { client_id, ip });
    }
}

/// Run one datastore write under `limit`, flattening a timeout into an error
async fn write<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, String> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(_) => Err(format!("write timed out after {:?}", limit)),
    }
}

async fn run_worker(
    store: Arc<dyn Datastore>,
    limit: Duration,
    mut rx: mpsc::UnboundedReceiver<StatEvent>,
) {
    // Connection log rows for sessions that are still open
    let mut open_logs: HashMap<SessionId, ConnectionLogId> = HashMap::new();

    while let Some(event) = rx.recv().await {
        match event {
            StatEvent::SessionOpened {
                session_id,
                client_id,
                at,
            } => match write(limit, store.open_connection_log(client_id, at)).await {
                Ok(log_id) => {
                    open_logs.insert(session_id, log_id);
                }
                Err(e) => warn!(client_id, error = %e, "Failed to log session start"),
            },
            StatEvent::SessionClosed { session_id, at } => {
                let Some(log_id) = open_logs.remove(&session_id) else {
                    continue;
                };
                if let Err(e) = write(limit, store.close_connection_log(log_id, at)).await {
                    warn!(log_id, error = %e, "Failed to log session end");
                }
            }
            StatEvent::RequestCompleted {
                client_id,
                model,
                duration_ms,
            } => {
                let call = store.append_request_log(client_id, &model, duration_ms);
                if let Err(e) = write(limit, call).await {
                    warn!(client_id, error = %e, "Failed to log request");
                }
            }
            StatEvent::LastSeenIp { client_id, ip } => {
                if let Err(e) = write(limit, store.record_last_seen_ip(client_id, &ip)).await {
                    warn!(client_id, error = %e, "Failed to record last seen IP");
                }
            }
        }
    }

    debug!("Stats worker finished");
}
