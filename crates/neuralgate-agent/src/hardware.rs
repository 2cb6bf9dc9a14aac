//! Hardware summary reported to the gateway after each connect

use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use url::Url;

use crate::config::Credentials;
use crate::AgentError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareSpecs {
    pub hostname: String,
    /// e.g. "linux", "macos", "windows"
    pub os: String,
    pub arch: String,
    pub cpu_cores: usize,
    pub agent_version: String,
}

impl HardwareSpecs {
    pub fn collect() -> Self {
        Self {
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            cpu_cores: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsReport<'a> {
    username: &'a str,
    slug: &'a str,
    api_key: &'a str,
    specs: &'a HardwareSpecs,
    /// Seconds
    uptime: f64,
}

#[derive(Clone)]
pub struct HardwareReporter {
    client: Client,
    url: Url,
}

impl HardwareReporter {
    pub fn new(url: Url) -> Result<Self, AgentError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self { client, url })
    }

    pub async fn report(
        &self,
        credentials: &Credentials,
        specs: &HardwareSpecs,
        uptime: Duration,
    ) -> Result<(), AgentError> {
        let report = StatsReport {
            username: &credentials.username,
            slug: &credentials.slug,
            api_key: &credentials.api_key,
            specs,
            uptime: uptime.as_secs_f64(),
        };

        self.client
            .post(self.url.clone())
            .json(&report)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
