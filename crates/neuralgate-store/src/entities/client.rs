//! Client entity: one agent endpoint under an account, with its API key and
//! access policy

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "clients")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Owning account
    pub user_id: i32,

    /// Second segment of the public URL; unique per account
    pub client_slug: String,

    /// Shared secret used both by the agent socket and by HTTP callers
    pub api_key: String,

    /// Comma separated IPs allowed to call this client (`*` allows any)
    #[sea_orm(column_type = "Text", nullable)]
    pub whitelisted_ips: Option<String>,

    /// When set, the whitelist is not enforced
    pub catch_mode: bool,

    /// Source IP of the most recent authenticated HTTP caller
    pub last_seen_ip: Option<String>,

    /// JSON hardware summary reported by the agent
    #[sea_orm(column_type = "Text", nullable)]
    pub hardware_info: Option<String>,

    /// Agent process uptime in seconds at its last report
    pub app_uptime: i64,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::UserId",
        to = "super::user::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    User,

    #[sea_orm(has_many = "super::connection_log::Entity")]
    ConnectionLogs,

    #[sea_orm(has_many = "super::request_log::Entity")]
    RequestLogs,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl Related<super::connection_log::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ConnectionLogs.def()
    }
}

impl Related<super::request_log::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::RequestLogs.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
