//! Neural Gateway hardware agent
//!
//! Holds one outbound WebSocket to the broker, forwards each request it
//! receives to a local HTTP backend (Ollama by default) and answers with the
//! backend's status and body under the same request id.

pub mod agent;
pub mod config;
pub mod forwarder;
pub mod hardware;

pub use agent::{Agent, SessionEnd};
pub use config::{AgentConfig, Credentials, DEFAULT_CONFIG_FILE, DEFAULT_UPSTREAM};
pub use forwarder::UpstreamForwarder;
pub use hardware::{HardwareReporter, HardwareSpecs};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config file {path}: {source}")]
    ConfigIo {
        path: String,
        source: std::io::Error,
    },

    #[error("Config file {path} is not valid JSON: {source}")]
    ConfigParse {
        path: String,
        source: serde_json::Error,
    },

    #[error("Unsupported method {0}")]
    InvalidMethod(String),

    #[error("Connection rejected by gateway ({code}): {reason}")]
    Rejected { code: u16, reason: String },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}
