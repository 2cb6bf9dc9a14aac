//! Protocol message types
//!
//! The broker sends one [`AgentRequest`] per forwarded HTTP request and the
//! agent answers each with exactly one [`AgentReply`] carrying the same
//! `requestId`. Both travel as JSON text frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Correlation key for one in-flight passthrough request
pub type RequestId = String;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Mint a fresh, collision-resistant request id. No ordering is implied.
pub fn new_request_id() -> RequestId {
    uuid::Uuid::new_v4().to_string()
}

/// Broker -> agent: one forwarded HTTP request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub request_id: RequestId,
    pub method: String,
    /// Subpath below `/users/{account}/{slug}/`, without a leading slash
    pub path: String,
    /// JSON request body, `null` when the caller sent none
    #[serde(default)]
    pub body: Value,
}

impl AgentRequest {
    pub fn to_json(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Status field of an [`AgentReply`] as the agent sent it.
///
/// Agents are not trusted to send a well-formed status, and a reply with a
/// readable `requestId` must still settle its request. Anything that is not
/// null or an integer in `0..=65535` is kept as [`ReplyStatus::Invalid`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyStatus {
    Code(u16),
    Invalid(Value),
}

impl Default for ReplyStatus {
    fn default() -> Self {
        ReplyStatus::Code(0)
    }
}

impl From<u16> for ReplyStatus {
    fn from(code: u16) -> Self {
        ReplyStatus::Code(code)
    }
}

impl From<Value> for ReplyStatus {
    fn from(raw: Value) -> Self {
        if raw.is_null() {
            return ReplyStatus::Code(0);
        }
        match raw.as_u64().and_then(|n| u16::try_from(n).ok()) {
            Some(code) => ReplyStatus::Code(code),
            None => ReplyStatus::Invalid(raw),
        }
    }
}

impl Serialize for ReplyStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ReplyStatus::Code(code) => serializer.serialize_u16(*code),
            ReplyStatus::Invalid(raw) => raw.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ReplyStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(ReplyStatus::from)
    }
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyStatus::Code(code) => write!(f, "{}", code),
            ReplyStatus::Invalid(raw) => write!(f, "{}", raw),
        }
    }
}

/// Agent -> broker: the outcome of one forwarded request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentReply {
    pub request_id: RequestId,
    /// HTTP status to relay; `0`, `null` or absent means 200
    #[serde(default)]
    pub status: ReplyStatus,
    #[serde(default)]
    pub data: Value,
}

impl AgentReply {
    pub fn new(request_id: impl Into<RequestId>, status: u16, data: Value) -> Self {
        Self {
            request_id: request_id.into(),
            status: ReplyStatus::Code(status),
            data,
        }
    }

    /// Status to relay to the caller, `None` when the agent sent garbage
    pub fn effective_status(&self) -> Option<u16> {
        match self.status {
            ReplyStatus::Code(0) => Some(200),
            ReplyStatus::Code(code) => Some(code),
            ReplyStatus::Invalid(_) => None,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Rewrite an explicit `"stream"` flag in a request body to `false`.
///
/// Only whole-response passthrough is supported, so a caller asking for a
/// streamed response gets a single buffered one instead. Returns `true` if
/// the body carried a flag.
pub fn force_non_streaming(body: &mut Value) -> bool {
    match body.as_object_mut() {
        Some(object) if object.contains_key("stream") => {
            object.insert("stream".to_string(), Value::Bool(false));
            true
        }
        _ => false,
    }
}

/// Model name a request targets, if the body names one
pub fn model_hint(body: &Value) -> Option<String> {
    body.get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}
