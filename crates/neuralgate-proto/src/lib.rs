//! Neural Gateway wire protocol
//!
//! Types shared by the broker and the hardware agent: the identity an agent
//! tunnels under, the parameters it connects with, and the JSON messages
//! exchanged over the persistent WebSocket.

pub mod identity;
pub mod messages;

pub use identity::{validate_api_key, ConnectParams, IdentityError, TunnelIdentity};
pub use messages::{
    force_non_streaming, model_hint, new_request_id, AgentReply, AgentRequest, ProtoError,
    ReplyStatus, RequestId,
};

/// Path of the agent WebSocket endpoint on the broker
pub const TUNNEL_PATH: &str = "/tunnel";

/// Close code sent when connect credentials are rejected (RFC 6455 policy violation)
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Close code sent to a session superseded by a newer connection for the same identity
pub const CLOSE_SESSION_REPLACED: u16 = 4001;

/// Close reason paired with [`CLOSE_POLICY_VIOLATION`]
pub const REASON_INVALID_CREDENTIALS: &str = "Invalid Credentials";

/// Close reason paired with [`CLOSE_SESSION_REPLACED`]
pub const REASON_SESSION_REPLACED: &str = "Session replaced";
