//! Per-request IP policy gate
//!
//! Runs after credentials validate. The caller's IP is recorded as the
//! client's last seen IP on every such request, whatever the outcome, so an
//! account owner can copy a rejected IP straight into the whitelist.

use neuralgate_store::{AccessPolicy, ClientId, Datastore, WILDCARD};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::stats::StatsLogger;
use crate::verifier::bounded;

/// Whether `policy` admits `source_ip`
///
/// Catch mode admits everything. Otherwise the whitelist must hold the
/// wildcard or the exact IP string.
pub fn permits(policy: &AccessPolicy, source_ip: &str) -> bool {
    policy.catch_mode
        || policy
            .whitelist
            .iter()
            .any(|entry| entry == WILDCARD || entry == source_ip)
}

/// Textual form used for matching and recording: IPv4-mapped IPv6
/// addresses collapse to plain IPv4
pub fn canonical_ip(ip: IpAddr) -> String {
    ip.to_canonical().to_string()
}

#[derive(Clone)]
pub struct AccessGate {
    store: Arc<dyn Datastore>,
    stats: StatsLogger,
    lookup_timeout: Duration,
}

impl AccessGate {
    pub fn new(store: Arc<dyn Datastore>, stats: StatsLogger, lookup_timeout: Duration) -> Self {
        Self {
            store,
            stats,
            lookup_timeout,
        }
    }

    /// Allow or deny a credential-valid caller. The policy is read fresh on
    /// every call.
    pub async fn authorize(&self, client_id: ClientId, source_ip: &str) -> Result<(), GatewayError> {
        self.stats.last_seen_ip(client_id, source_ip.to_string());

        let policy = bounded(self.lookup_timeout, self.store.load_policy(client_id))
            .await?
            .ok_or(GatewayError::ClientNotFound)?;

        if policy.catch_mode {
            info!(client_id, ip = %source_ip, "Catch mode: allowed");
            return Ok(());
        }

        if permits(&policy, source_ip) {
            return Ok(());
        }

        warn!(client_id, ip = %source_ip, "Blocked IP not on whitelist");
        Err(GatewayError::Forbidden {
            detected_ip: source_ip.to_string(),
        })
    }
}
