//! Tunnel identity and connect parameters

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const MAX_SEGMENT_LEN: usize = 64;
const MAX_API_KEY_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("missing {0}")]
    Missing(&'static str),

    #[error("invalid {0}")]
    Invalid(&'static str),
}

/// Composite key addressing one agent endpoint: `(account handle, client slug)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelIdentity {
    pub account: String,
    pub slug: String,
}

impl TunnelIdentity {
    /// Build an identity, rejecting empty or malformed segments
    pub fn new(account: impl Into<String>, slug: impl Into<String>) -> Result<Self, IdentityError> {
        let account = account.into();
        let slug = slug.into();
        validate_segment(&account, "username")?;
        validate_segment(&slug, "slug")?;
        Ok(Self { account, slug })
    }
}

impl fmt::Display for TunnelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account, self.slug)
    }
}

/// Parameters an agent supplies in the WebSocket URL query string:
/// `/tunnel?username=..&slug=..&key=..`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectParams {
    pub username: Option<String>,
    pub slug: Option<String>,
    pub key: Option<String>,
}

impl ConnectParams {
    pub fn new(username: &str, slug: &str, key: &str) -> Self {
        Self {
            username: Some(username.to_string()),
            slug: Some(slug.to_string()),
            key: Some(key.to_string()),
        }
    }

    /// Validate presence and shape of all three values, yielding the identity
    /// and the API key
    pub fn into_parts(self) -> Result<(TunnelIdentity, String), IdentityError> {
        let username = self.username.ok_or(IdentityError::Missing("username"))?;
        let slug = self.slug.ok_or(IdentityError::Missing("slug"))?;
        let key = self.key.ok_or(IdentityError::Missing("key"))?;
        validate_api_key(&key)?;
        Ok((TunnelIdentity::new(username, slug)?, key))
    }
}

fn validate_segment(value: &str, what: &'static str) -> Result<(), IdentityError> {
    if value.is_empty() {
        return Err(IdentityError::Missing(what));
    }
    let well_formed = value.len() <= MAX_SEGMENT_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !well_formed {
        return Err(IdentityError::Invalid(what));
    }
    Ok(())
}

/// API keys are opaque, but must be non-empty printable ASCII without spaces
pub fn validate_api_key(key: &str) -> Result<(), IdentityError> {
    if key.is_empty() {
        return Err(IdentityError::Missing("key"));
    }
    if key.len() > MAX_API_KEY_LEN || !key.chars().all(|c| c.is_ascii_graphic()) {
        return Err(IdentityError::Invalid("key"));
    }
    Ok(())
}
