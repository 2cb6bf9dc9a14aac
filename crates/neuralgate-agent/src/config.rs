//! Agent configuration and the `gateway.conf` credentials file

use neuralgate_proto::{ConnectParams, TunnelIdentity, TUNNEL_PATH};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

use crate::AgentError;

pub const DEFAULT_CONFIG_FILE: &str = "gateway.conf";

/// Local Ollama
pub const DEFAULT_UPSTREAM: &str = "http://127.0.0.1:11434";

const REPORT_STATS_PATH: &str = "/api/report-stats";

/// Credentials persisted in `gateway.conf`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub api_key: String,
}

impl Credentials {
    pub fn new(
        username: impl Into<String>,
        slug: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            slug: slug.into(),
            api_key: api_key.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.username.is_empty() && !self.slug.is_empty() && !self.api_key.is_empty()
    }

    /// Identity these credentials tunnel under, after shape validation
    pub fn identity(&self) -> Result<TunnelIdentity, AgentError> {
        ConnectParams::new(&self.username, &self.slug, &self.api_key)
            .into_parts()
            .map(|(identity, _)| identity)
            .map_err(|e| AgentError::InvalidConfig(e.to_string()))
    }

    /// Read credentials from `path`. A missing or incomplete file yields `None`.
    pub fn load(path: &Path) -> Result<Option<Self>, AgentError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(AgentError::ConfigIo {
                    path: path.display().to_string(),
                    source,
                })
            }
        };

        let credentials: Self =
            serde_json::from_str(&contents).map_err(|source| AgentError::ConfigParse {
                path: path.display().to_string(),
                source,
            })?;

        if !credentials.is_complete() {
            warn!("Configuration file {} is incomplete", path.display());
            return Ok(None);
        }

        info!("Loaded configuration for user: {}", credentials.username);
        Ok(Some(credentials))
    }

    /// Write credentials to `path` as pretty JSON
    pub fn save(&self, path: &Path) -> Result<(), AgentError> {
        let contents = serde_json::to_string_pretty(self).map_err(|source| {
            AgentError::ConfigParse {
                path: path.display().to_string(),
                source,
            }
        })?;

        fs::write(path, contents).map_err(|source| AgentError::ConfigIo {
            path: path.display().to_string(),
            source,
        })?;

        info!("Configuration saved to {}", path.display());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Broker tunnel endpoint, `ws://` or `wss://`
    pub gateway_url: Url,

    /// Where hardware stats go; derived from `gateway_url` when unset
    pub report_url: Option<Url>,

    pub credentials: Credentials,

    /// Base URL requests are forwarded to
    pub upstream: Url,

    /// Skip the hardware stats report
    pub optout_stats: bool,

    pub reconnect_delay: Duration,

    /// Wait between upstream probes while the backend is down
    pub probe_retry: Duration,

    pub ping_interval: Duration,

    /// Ceiling on one upstream round trip
    pub upstream_timeout: Duration,
}

impl AgentConfig {
    pub fn new(
        gateway_url: &str,
        credentials: Credentials,
        upstream: &str,
    ) -> Result<Self, AgentError> {
        let gateway_url = Url::parse(gateway_url)
            .map_err(|e| AgentError::InvalidConfig(format!("gateway URL: {}", e)))?;
        if !matches!(gateway_url.scheme(), "ws" | "wss") {
            return Err(AgentError::InvalidConfig(format!(
                "gateway URL must use ws:// or wss://, got {}",
                gateway_url
            )));
        }

        let upstream = Url::parse(upstream)
            .map_err(|e| AgentError::InvalidConfig(format!("upstream URL: {}", e)))?;
        if !matches!(upstream.scheme(), "http" | "https") {
            return Err(AgentError::InvalidConfig(format!(
                "upstream URL must use http:// or https://, got {}",
                upstream
            )));
        }

        credentials.identity()?;

        Ok(Self {
            gateway_url,
            report_url: None,
            credentials,
            upstream,
            optout_stats: false,
            reconnect_delay: Duration::from_secs(5),
            probe_retry: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            upstream_timeout: Duration::from_secs(300),
        })
    }

    /// Gateway URL with the connect parameters in its query string
    pub fn tunnel_url(&self) -> Url {
        let mut url = self.gateway_url.clone();
        if url.path().is_empty() || url.path() == "/" {
            url.set_path(TUNNEL_PATH);
        }
        url.query_pairs_mut()
            .clear()
            .append_pair("username", &self.credentials.username)
            .append_pair("slug", &self.credentials.slug)
            .append_pair("key", &self.credentials.api_key);
        url
    }

    /// Hardware report endpoint on the same host as the gateway
    pub fn stats_url(&self) -> Result<Url, AgentError> {
        if let Some(url) = &self.report_url {
            return Ok(url.clone());
        }

        let mut url = self.gateway_url.clone();
        let scheme = if url.scheme() == "wss" { "https" } else { "http" };
        url.set_scheme(scheme).map_err(|_| {
            AgentError::InvalidConfig(format!("cannot derive stats URL from {}", self.gateway_url))
        })?;
        url.set_path(REPORT_STATS_PATH);
        url.set_query(None);
        Ok(url)
    }
}
