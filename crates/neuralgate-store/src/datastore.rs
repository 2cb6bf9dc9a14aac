//! Datastore collaborator consumed by the broker
//!
//! The broker only ever talks to storage through [`Datastore`], so the data
//! path can be exercised against a mock and deployments can pick any backend
//! sea-orm supports.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set,
};
use thiserror::Error;
use tracing::debug;

use crate::entities::{client, connection_log, request_log, user};

pub type AccountId = i32;
pub type ClientId = i32;
pub type ConnectionLogId = i32;

/// Whitelist entry that admits any source IP
pub const WILDCARD: &str = "*";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    #[error("Already exists: {0}")]
    Conflict(String),
}

/// Stored secret for one client, resolved under a known account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCredential {
    pub client_id: ClientId,
    pub api_key: String,
}

/// Per-client IP policy, loaded fresh for every passthrough request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessPolicy {
    pub whitelist: Vec<String>,
    pub catch_mode: bool,
}

impl AccessPolicy {
    /// Build from the stored comma separated whitelist column
    pub fn from_columns(whitelisted_ips: Option<&str>, catch_mode: bool) -> Self {
        let whitelist = whitelisted_ips
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::to_string)
            .collect();

        Self {
            whitelist,
            catch_mode,
        }
    }

    /// Column form of the whitelist; `None` when empty
    pub fn whitelist_column(&self) -> Option<String> {
        if self.whitelist.is_empty() {
            None
        } else {
            Some(self.whitelist.join(","))
        }
    }
}

#[async_trait]
pub trait Datastore: Send + Sync {
    /// Account id for a handle
    async fn find_account(&self, username: &str) -> Result<Option<AccountId>, StoreError>;

    /// Client registered under `account` with the given slug
    async fn find_client(
        &self,
        account: AccountId,
        slug: &str,
    ) -> Result<Option<ClientCredential>, StoreError>;

    /// Current access policy; `None` if the client no longer exists
    async fn load_policy(&self, client: ClientId) -> Result<Option<AccessPolicy>, StoreError>;

    async fn record_last_seen_ip(&self, client: ClientId, ip: &str) -> Result<(), StoreError>;

    async fn open_connection_log(
        &self,
        client: ClientId,
        connected_at: DateTime<Utc>,
    ) -> Result<ConnectionLogId, StoreError>;

    async fn close_connection_log(
        &self,
        log: ConnectionLogId,
        disconnected_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn append_request_log(
        &self,
        client: ClientId,
        model: &str,
        duration_ms: i64,
    ) -> Result<(), StoreError>;

    /// Store the agent's self-reported hardware summary and uptime
    async fn report_hardware(
        &self,
        client: ClientId,
        hardware_info: &str,
        uptime_secs: i64,
    ) -> Result<(), StoreError>;
}

/// sea-orm backed datastore
#[derive(Clone)]
pub struct SqlDatastore {
    db: DatabaseConnection,
}

impl SqlDatastore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Create an account, failing if the handle is taken
    pub async fn create_account(
        &self,
        username: &str,
        email: Option<&str>,
    ) -> Result<AccountId, StoreError> {
        if self.find_account(username).await?.is_some() {
            return Err(StoreError::Conflict(format!("user {}", username)));
        }

        let account = user::ActiveModel {
            username: Set(username.to_string()),
            email: Set(email.map(str::to_string)),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(&self.db)
        .await?;

        debug!(username = %username, id = account.id, "Created account");
        Ok(account.id)
    }

    /// Look up an account, creating it when missing
    pub async fn ensure_account(&self, username: &str) -> Result<AccountId, StoreError> {
        match self.find_account(username).await? {
            Some(id) => Ok(id),
            None => self.create_account(username, None).await,
        }
    }

    /// Register a new client with a freshly generated API key
    pub async fn create_client(
        &self,
        account: AccountId,
        slug: &str,
        policy: &AccessPolicy,
    ) -> Result<ClientCredential, StoreError> {
        if self.find_client(account, slug).await?.is_some() {
            return Err(StoreError::Conflict(format!("client {}", slug)));
        }

        let created = client::ActiveModel {
            user_id: Set(account),
            client_slug: Set(slug.to_string()),
            api_key: Set(generate_api_key()),
            whitelisted_ips: Set(policy.whitelist_column()),
            catch_mode: Set(policy.catch_mode),
            last_seen_ip: Set(None),
            hardware_info: Set(None),
            app_uptime: Set(0),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(&self.db)
        .await?;

        debug!(slug = %slug, id = created.id, "Created client");
        Ok(ClientCredential {
            client_id: created.id,
            api_key: created.api_key,
        })
    }

    /// Replace a client's whitelist and catch-mode flag
    pub async fn update_policy(
        &self,
        client_id: ClientId,
        policy: &AccessPolicy,
    ) -> Result<(), StoreError> {
        client::Entity::update_many()
            .col_expr(
                client::Column::WhitelistedIps,
                Expr::value(policy.whitelist_column()),
            )
            .col_expr(client::Column::CatchMode, Expr::value(policy.catch_mode))
            .filter(client::Column::Id.eq(client_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Datastore for SqlDatastore {
    async fn find_account(&self, username: &str) -> Result<Option<AccountId>, StoreError> {
        let account = user::Entity::find()
            .filter(user::Column::Username.eq(username))
            .one(&self.db)
            .await?;
        Ok(account.map(|a| a.id))
    }

    async fn find_client(
        &self,
        account: AccountId,
        slug: &str,
    ) -> Result<Option<ClientCredential>, StoreError> {
        let found = client::Entity::find()
            .filter(client::Column::UserId.eq(account))
            .filter(client::Column::ClientSlug.eq(slug))
            .one(&self.db)
            .await?;
        Ok(found.map(|c| ClientCredential {
            client_id: c.id,
            api_key: c.api_key,
        }))
    }

    async fn load_policy(&self, client_id: ClientId) -> Result<Option<AccessPolicy>, StoreError> {
        let found = client::Entity::find_by_id(client_id).one(&self.db).await?;
        Ok(found.map(|c| AccessPolicy::from_columns(c.whitelisted_ips.as_deref(), c.catch_mode)))
    }

    async fn record_last_seen_ip(&self, client_id: ClientId, ip: &str) -> Result<(), StoreError> {
        client::Entity::update_many()
            .col_expr(client::Column::LastSeenIp, Expr::value(ip))
            .filter(client::Column::Id.eq(client_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn open_connection_log(
        &self,
        client_id: ClientId,
        connected_at: DateTime<Utc>,
    ) -> Result<ConnectionLogId, StoreError> {
        let log = connection_log::ActiveModel {
            client_id: Set(client_id),
            connected_at: Set(connected_at),
            disconnected_at: Set(None),
            ..Default::default()
        }
        .insert(&self.db)
        .await?;
        Ok(log.id)
    }

    async fn close_connection_log(
        &self,
        log_id: ConnectionLogId,
        disconnected_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        connection_log::Entity::update_many()
            .col_expr(
                connection_log::Column::DisconnectedAt,
                Expr::value(disconnected_at),
            )
            .filter(connection_log::Column::Id.eq(log_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn append_request_log(
        &self,
        client_id: ClientId,
        model: &str,
        duration_ms: i64,
    ) -> Result<(), StoreError> {
        request_log::ActiveModel {
            client_id: Set(client_id),
            model: Set(model.to_string()),
            duration_ms: Set(duration_ms),
            timestamp: Set(Utc::now()),
            ..Default::default()
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    async fn report_hardware(
        &self,
        client_id: ClientId,
        hardware_info: &str,
        uptime_secs: i64,
    ) -> Result<(), StoreError> {
        client::Entity::update_many()
            .col_expr(client::Column::HardwareInfo, Expr::value(hardware_info))
            .col_expr(client::Column::AppUptime, Expr::value(uptime_secs))
            .filter(client::Column::Id.eq(client_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }
}

/// Fresh client API key: `sk-` followed by 32 hex digits
pub fn generate_api_key() -> String {
    format!("sk-{}", uuid::Uuid::new_v4().simple())
}
