//! Passthrough dispatcher: HTTP request -> agent message -> settled reply

use neuralgate_proto::{
    force_non_streaming, model_hint, new_request_id, AgentRequest, TunnelIdentity,
};
use neuralgate_store::ClientId;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::correlator::{Correlator, RequestMeta, Settlement};
use crate::error::GatewayError;
use crate::registry::SessionRegistry;

/// Model recorded when the request body names none
pub const UNKNOWN_MODEL: &str = "unknown";

#[derive(Debug, Error, PartialEq)]
pub enum DispatchError {
    #[error("agent offline")]
    Offline,

    #[error("agent did not reply in time")]
    TimedOut,

    #[error("agent disconnected")]
    AgentGone,

    #[error("invalid status {0} from agent")]
    InvalidStatus(String),

    #[error("could not encode request: {0}")]
    Encode(String),
}

impl From<DispatchError> for GatewayError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Offline => GatewayError::Offline,
            DispatchError::TimedOut => GatewayError::Timeout,
            DispatchError::AgentGone => GatewayError::BadGateway(
                "User Hardware disconnected before replying.".to_string(),
            ),
            DispatchError::InvalidStatus(status) => {
                GatewayError::BadGateway(format!("Hardware replied with invalid status {}", status))
            }
            DispatchError::Encode(detail) => GatewayError::Internal(detail),
        }
    }
}

/// Agent reply with a validated status, ready to relay
#[derive(Debug, Clone, PartialEq)]
pub struct Relayed {
    pub status: u16,
    pub data: Value,
}

/// One passthrough request, already authorized
#[derive(Debug, Clone)]
pub struct Passthrough {
    pub identity: TunnelIdentity,
    pub client_id: ClientId,
    pub method: String,
    /// Path below `/users/{account}/{slug}/`
    pub subpath: String,
    pub body: Value,
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    correlator: Correlator,
}

impl Dispatcher {
    pub fn new(registry: Arc<SessionRegistry>, correlator: Correlator) -> Self {
        Self {
            registry,
            correlator,
        }
    }

    /// Forward a request to the identity's agent and wait for its reply.
    ///
    /// Fails fast with [`DispatchError::Offline`] when no open session
    /// exists; no request id is minted in that case.
    pub async fn dispatch(&self, request: Passthrough) -> Result<Relayed, DispatchError> {
        let session = self
            .registry
            .lookup(&request.identity)
            .ok_or(DispatchError::Offline)?;

        let mut body = request.body;
        if force_non_streaming(&mut body) {
            debug!(identity = %request.identity, "Forced stream=false");
        }
        let model = model_hint(&body).unwrap_or_else(|| UNKNOWN_MODEL.to_string());

        let message = AgentRequest {
            request_id: new_request_id(),
            method: request.method,
            path: request.subpath,
            body,
        };
        let text = message
            .to_json()
            .map_err(|e| DispatchError::Encode(e.to_string()))?;

        let pending = self.correlator.create(
            message.request_id.clone(),
            RequestMeta::new(request.client_id, session.id(), model),
        );

        if session.send(text).is_err() {
            // Dropping `pending` discards the entry
            warn!(identity = %request.identity, "Session closed while dispatching");
            return Err(DispatchError::Offline);
        }

        debug!(
            identity = %request.identity,
            request_id = %message.request_id,
            method = %message.method,
            path = %message.path,
            "Forwarded request to agent"
        );

        match pending.settle().await {
            Settlement::Replied(reply) => match reply.effective_status() {
                Some(status) if (100..=999).contains(&status) => Ok(Relayed {
                    status,
                    data: reply.data,
                }),
                _ => {
                    warn!(
                        identity = %request.identity,
                        status = %reply.status,
                        "Agent replied with an invalid status"
                    );
                    Err(DispatchError::InvalidStatus(reply.status.to_string()))
                }
            },
            Settlement::TimedOut => Err(DispatchError::TimedOut),
            Settlement::AgentGone => Err(DispatchError::AgentGone),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{AgentSession, OutboundFrame};
    use neuralgate_proto::AgentReply;
    use serde_json::json;
    use std::time::Duration;

    fn setup() -> (Dispatcher, Arc<SessionRegistry>, Correlator) {
        let registry = Arc::new(SessionRegistry::new());
        let correlator = Correlator::new(Duration::from_secs(300));
        (
            Dispatcher::new(registry.clone(), correlator.clone()),
            registry,
            correlator,
        )
    }

    fn passthrough(body: Value) -> Passthrough {
        Passthrough {
            identity: TunnelIdentity::new("alice", "gpu1").unwrap(),
            client_id: 10,
            method: "POST".into(),
            subpath: "generate".into(),
            body,
        }
    }

    fn sent_request(frame: OutboundFrame) -> AgentRequest {
        match frame {
            OutboundFrame::Text(text) => AgentRequest::from_json(&text).unwrap(),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_offline_fails_fast_without_pending_entry() {
        let (dispatcher, _registry, correlator) = setup();

        let err = dispatcher.dispatch(passthrough(json!({}))).await.unwrap_err();
        assert_eq!(err, DispatchError::Offline);
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn test_stream_flag_forced_false_and_reply_relayed() {
        let (dispatcher, registry, correlator) = setup();
        let (session, mut outbound) =
            AgentSession::new(TunnelIdentity::new("alice", "gpu1").unwrap(), 10);
        let session_id = session.id();
        registry.register(session);

        let call = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher
                    .dispatch(passthrough(json!({"model": "llama3", "stream": true})))
                    .await
            }
        });

        let sent = sent_request(outbound.recv().await.unwrap());
        assert_eq!(sent.method, "POST");
        assert_eq!(sent.path, "generate");
        assert_eq!(sent.body, json!({"model": "llama3", "stream": false}));

        let meta = correlator
            .resolve(
                session_id,
                AgentReply::new(sent.request_id.clone(), 200, json!({"response": "hi"})),
            )
            .unwrap();
        assert_eq!(meta.model, "llama3");
        assert_eq!(meta.client_id, 10);

        let reply = call.await.unwrap().unwrap();
        assert_eq!(reply.data, json!({"response": "hi"}));
    }

    #[tokio::test]
    async fn test_invalid_status_is_bad_gateway() {
        let (dispatcher, registry, correlator) = setup();
        let (session, mut outbound) =
            AgentSession::new(TunnelIdentity::new("alice", "gpu1").unwrap(), 10);
        let session_id = session.id();
        registry.register(session);

        let call = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.dispatch(passthrough(Value::Null)).await }
        });

        let sent = sent_request(outbound.recv().await.unwrap());
        correlator.resolve(session_id, AgentReply::new(sent.request_id, 42, Value::Null));

        assert_eq!(
            call.await.unwrap().unwrap_err(),
            DispatchError::InvalidStatus("42".to_string())
        );
    }

    #[tokio::test]
    async fn test_unreadable_status_settles_as_bad_gateway() {
        let (dispatcher, registry, correlator) = setup();
        let (session, mut outbound) =
            AgentSession::new(TunnelIdentity::new("alice", "gpu1").unwrap(), 10);
        let session_id = session.id();
        registry.register(session);

        let call = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.dispatch(passthrough(Value::Null)).await }
        });

        let sent = sent_request(outbound.recv().await.unwrap());
        let text = format!(r#"{{"requestId":"{}","status":-1}}"#, sent.request_id);
        let reply = AgentReply::from_json(&text).unwrap();
        assert!(correlator.resolve(session_id, reply).is_some());

        assert_eq!(
            call.await.unwrap().unwrap_err(),
            DispatchError::InvalidStatus("-1".to_string())
        );
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn test_null_status_relays_as_ok() {
        let (dispatcher, registry, correlator) = setup();
        let (session, mut outbound) =
            AgentSession::new(TunnelIdentity::new("alice", "gpu1").unwrap(), 10);
        let session_id = session.id();
        registry.register(session);

        let call = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.dispatch(passthrough(Value::Null)).await }
        });

        let sent = sent_request(outbound.recv().await.unwrap());
        let text = format!(
            r#"{{"requestId":"{}","status":null,"data":{{"ok":true}}}}"#,
            sent.request_id
        );
        correlator.resolve(session_id, AgentReply::from_json(&text).unwrap());

        assert_eq!(
            call.await.unwrap().unwrap(),
            Relayed {
                status: 200,
                data: json!({"ok": true})
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_agent_times_out() {
        let (dispatcher, registry, correlator) = setup();
        let (session, _outbound) =
            AgentSession::new(TunnelIdentity::new("alice", "gpu1").unwrap(), 10);
        registry.register(session);

        let err = dispatcher.dispatch(passthrough(Value::Null)).await.unwrap_err();
        assert_eq!(err, DispatchError::TimedOut);
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn test_agent_gone_mid_flight() {
        let (dispatcher, registry, correlator) = setup();
        let (session, mut outbound) =
            AgentSession::new(TunnelIdentity::new("alice", "gpu1").unwrap(), 10);
        let session_id = session.id();
        registry.register(session);

        let call = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.dispatch(passthrough(Value::Null)).await }
        });

        outbound.recv().await.unwrap();
        assert_eq!(correlator.abandon_session(session_id), 1);
        assert_eq!(call.await.unwrap().unwrap_err(), DispatchError::AgentGone);
    }
}
