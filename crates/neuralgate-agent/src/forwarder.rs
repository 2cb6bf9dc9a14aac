//! Forwards broker requests to the local HTTP backend

use neuralgate_proto::{AgentReply, AgentRequest};
use reqwest::{Client, Method};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::AgentError;

#[derive(Clone)]
pub struct UpstreamForwarder {
    client: Client,
    base: Url,
}

impl UpstreamForwarder {
    pub fn new(base: Url, timeout: Duration) -> Result<Self, AgentError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Whether the backend answers at all; any HTTP status counts
    pub async fn probe(&self) -> bool {
        self.client.get(self.base.clone()).send().await.is_ok()
    }

    fn target(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Run one request against the backend and build the reply for it.
    ///
    /// Never fails: transport errors become a 502 reply so the broker's
    /// caller is answered instead of waiting out the timeout.
    pub async fn forward(&self, request: &AgentRequest) -> AgentReply {
        match self.exchange(request).await {
            Ok((status, data)) => {
                debug!(request_id = %request.request_id, status, "Backend responded");
                AgentReply::new(request.request_id.clone(), status, data)
            }
            Err(e) => {
                warn!(request_id = %request.request_id, error = %e, "Backend request failed");
                AgentReply::new(
                    request.request_id.clone(),
                    502,
                    json!({ "error": format!("Agent error: {}", e) }),
                )
            }
        }
    }

    async fn exchange(&self, request: &AgentRequest) -> Result<(u16, Value), AgentError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| AgentError::InvalidMethod(request.method.clone()))?;

        let mut builder = self.client.request(method, self.target(&request.path));
        if !request.body.is_null() {
            builder = builder.json(&request.body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;

        // Non-JSON bodies are relayed as a JSON string
        let data = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok((status, data))
    }
}
