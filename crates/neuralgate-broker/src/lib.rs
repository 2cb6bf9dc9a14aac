//! Neural Gateway broker
//!
//! Bridges public HTTP callers to hardware agents that hold one outbound
//! WebSocket each. A caller's request to `/users/{account}/{slug}/...` is
//! authenticated, checked against the client's IP policy, forwarded over the
//! agent's socket under a fresh request id, and answered with the agent's
//! reply (or 502/504 when the agent is offline or silent).

pub mod access;
pub mod config;
pub mod correlator;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod ingress;
pub mod rate_limit;
pub mod registry;
pub mod server;
pub mod stats;
pub mod tunnel;
pub mod verifier;

pub use access::{canonical_ip, permits, AccessGate};
pub use config::{BrokerConfig, RateLimitConfig};
pub use correlator::{Correlator, PendingRequest, RequestMeta, Settlement};
pub use dispatcher::{DispatchError, Dispatcher, Passthrough, Relayed};
pub use error::{ErrorResponse, GatewayError};
pub use rate_limit::{RateDecision, RateLimiter};
pub use registry::{AgentSession, OutboundFrame, SessionId, SessionRegistry};
pub use server::{AppState, Broker};
pub use stats::{StatEvent, StatsLogger};
pub use verifier::{Verified, Verifier, VerifyError};
