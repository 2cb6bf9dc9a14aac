//! Helpers for reading public HTTP requests

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Request},
    http::HeaderMap,
};
use serde_json::Value;
use std::net::{IpAddr, SocketAddr};

use crate::error::GatewayError;

const FORWARDED_FOR: &str = "x-forwarded-for";

/// The caller's IP, canonicalized
///
/// With `trust_proxy` the leftmost `X-Forwarded-For` entry wins; otherwise
/// (or when that header is absent or unparsable) the TCP peer address is used.
pub fn source_ip(request: &Request, trust_proxy: bool) -> Option<IpAddr> {
    let forwarded = trust_proxy
        .then(|| forwarded_for(request.headers()))
        .flatten();

    forwarded
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip())
        })
        .map(|ip| ip.to_canonical())
}

fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    let value = headers.get(FORWARDED_FOR)?.to_str().ok()?;
    let first = value.split(',').next()?.trim();
    first.parse().ok()
}

/// Parse a passthrough body: empty means `null`, anything else must be JSON
pub fn parse_json_body(bytes: &Bytes) -> Result<Value, GatewayError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(bytes)
        .map_err(|e| GatewayError::BadRequest(format!("Request body is not valid JSON: {}", e)))
}
