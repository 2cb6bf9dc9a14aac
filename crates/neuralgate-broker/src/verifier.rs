//! Credential verification for agent connects and passthrough callers
//!
//! The same triple `(account, slug, api key)` is checked at both trust
//! boundaries; only its provenance differs (socket query string vs. URL path
//! plus bearer header).

use neuralgate_proto::{validate_api_key, IdentityError, TunnelIdentity};
use neuralgate_store::{ClientId, Datastore, StoreError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::GatewayError;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("malformed credentials: {0}")]
    Malformed(#[from] IdentityError),

    #[error("unknown account")]
    UnknownAccount,

    #[error("unknown client")]
    UnknownClient,

    #[error("api key mismatch")]
    BadKey,

    #[error("datastore unavailable: {0}")]
    Unavailable(String),
}

impl From<VerifyError> for GatewayError {
    fn from(err: VerifyError) -> Self {
        match err {
            VerifyError::Malformed(IdentityError::Missing("key"))
            | VerifyError::Malformed(IdentityError::Invalid("key"))
            | VerifyError::BadKey => GatewayError::InvalidApiKey,
            VerifyError::Malformed(e) => GatewayError::BadRequest(e.to_string()),
            VerifyError::UnknownAccount => GatewayError::UserNotFound,
            VerifyError::UnknownClient => GatewayError::ClientNotFound,
            VerifyError::Unavailable(detail) => GatewayError::Internal(detail),
        }
    }
}

/// A credential triple that matched a stored client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verified {
    pub identity: TunnelIdentity,
    pub client_id: ClientId,
}

#[derive(Clone)]
pub struct Verifier {
    store: Arc<dyn Datastore>,
    lookup_timeout: Duration,
}

impl Verifier {
    pub fn new(store: Arc<dyn Datastore>, lookup_timeout: Duration) -> Self {
        Self {
            store,
            lookup_timeout,
        }
    }

    /// Check a credential triple. Shape validation runs before any datastore access.
    pub async fn verify(
        &self,
        account: &str,
        slug: &str,
        api_key: &str,
    ) -> Result<Verified, VerifyError> {
        let identity = TunnelIdentity::new(account, slug)?;
        validate_api_key(api_key)?;

        let account_id = bounded(self.lookup_timeout, self.store.find_account(account))
            .await?
            .ok_or(VerifyError::UnknownAccount)?;

        let credential = bounded(self.lookup_timeout, self.store.find_client(account_id, slug))
            .await?
            .ok_or(VerifyError::UnknownClient)?;

        if !bool::from(credential.api_key.as_bytes().ct_eq(api_key.as_bytes())) {
            debug!(identity = %identity, "API key mismatch");
            return Err(VerifyError::BadKey);
        }

        Ok(Verified {
            identity,
            client_id: credential.client_id,
        })
    }
}

/// Run a datastore call under the lookup ceiling
pub(crate) async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, VerifyError> {
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            warn!(error = %e, "Datastore lookup failed");
            Err(VerifyError::Unavailable(e.to_string()))
        }
        Err(_) => {
            warn!(timeout = ?limit, "Datastore lookup timed out");
            Err(VerifyError::Unavailable("lookup timed out".to_string()))
        }
    }
}

/// Pull the token out of an `Authorization: Bearer <token>` header value
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockStore;
    use neuralgate_store::ClientCredential;

    fn store_with_alice() -> MockStore {
        let mut store = MockStore::new();
        store
            .expect_find_account()
            .returning(|name| Ok((name == "alice").then_some(1)));
        store.expect_find_client().returning(|account, slug| {
            Ok((account == 1 && slug == "gpu1").then(|| ClientCredential {
                client_id: 10,
                api_key: "sk-abc".to_string(),
            }))
        });
        store
    }

    fn verifier(store: MockStore) -> Verifier {
        Verifier::new(Arc::new(store), Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_valid_triple() {
        let verified = verifier(store_with_alice())
            .verify("alice", "gpu1", "sk-abc")
            .await
            .unwrap();
        assert_eq!(verified.client_id, 10);
        assert_eq!(verified.identity.to_string(), "alice/gpu1");
    }

    #[tokio::test]
    async fn test_failures_are_distinguished() {
        let v = verifier(store_with_alice());

        assert!(matches!(
            v.verify("bob", "gpu1", "sk-abc").await,
            Err(VerifyError::UnknownAccount)
        ));
        assert!(matches!(
            v.verify("alice", "gpu2", "sk-abc").await,
            Err(VerifyError::UnknownClient)
        ));
        assert!(matches!(
            v.verify("alice", "gpu1", "sk-abd").await,
            Err(VerifyError::BadKey)
        ));
    }

    #[tokio::test]
    async fn test_malformed_input_never_reaches_store() {
        let mut store = MockStore::new();
        store.expect_find_account().times(0);
        store.expect_find_client().times(0);
        let v = verifier(store);

        assert!(matches!(
            v.verify("", "gpu1", "sk-abc").await,
            Err(VerifyError::Malformed(IdentityError::Missing("username")))
        ));
        assert!(matches!(
            v.verify("alice", "gpu1", "").await,
            Err(VerifyError::Malformed(IdentityError::Missing("key")))
        ));
    }

    #[tokio::test]
    async fn test_store_failure_is_unavailable() {
        let mut store = MockStore::new();
        store
            .expect_find_account()
            .returning(|_| Err(StoreError::Conflict("boom".into())));

        let err = verifier(store)
            .verify("alice", "gpu1", "sk-abc")
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::Unavailable(_)));
        assert!(matches!(GatewayError::from(err), GatewayError::Internal(_)));
    }

    #[test]
    fn test_gateway_mapping() {
        assert!(matches!(
            GatewayError::from(VerifyError::Malformed(IdentityError::Missing("key"))),
            GatewayError::InvalidApiKey
        ));
        assert!(matches!(
            GatewayError::from(VerifyError::UnknownAccount),
            GatewayError::UserNotFound
        ));
        assert!(matches!(
            GatewayError::from(VerifyError::UnknownClient),
            GatewayError::ClientNotFound
        ));
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token("Bearer sk-abc"), Some("sk-abc"));
        assert_eq!(bearer_token("bearer   sk-abc  "), Some("sk-abc"));
        assert_eq!(bearer_token("Basic dXNlcg=="), None);
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token(""), None);
    }
}
