//! Initial schema: accounts, clients, connection and request logs

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ============================================================
        // 1. users
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(User::Table)
                    .if_not_exists()
                    .col(pk_auto(User::Id))
                    .col(string_len(User::Username, 64).not_null().unique_key())
                    .col(string_len_null(User::Email, 255))
                    .col(
                        timestamp_with_time_zone(User::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 2. clients
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Client::Table)
                    .if_not_exists()
                    .col(pk_auto(Client::Id))
                    .col(integer(Client::UserId).not_null())
                    .col(string_len(Client::ClientSlug, 64).not_null())
                    .col(string_len(Client::ApiKey, 256).not_null())
                    .col(text_null(Client::WhitelistedIps))
                    .col(boolean(Client::CatchMode).not_null().default(false))
                    .col(string_len_null(Client::LastSeenIp, 64))
                    .col(text_null(Client::HardwareInfo))
                    .col(big_integer(Client::AppUptime).not_null().default(0))
                    .col(
                        timestamp_with_time_zone(Client::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_clients_user_id")
                            .from(Client::Table, Client::UserId)
                            .to(User::Table, User::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_clients_user_slug")
                    .table(Client::Table)
                    .col(Client::UserId)
                    .col(Client::ClientSlug)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 3. connection_logs
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(ConnectionLog::Table)
                    .if_not_exists()
                    .col(pk_auto(ConnectionLog::Id))
                    .col(integer(ConnectionLog::ClientId).not_null())
                    .col(timestamp_with_time_zone(ConnectionLog::ConnectedAt).not_null())
                    .col(timestamp_with_time_zone_null(
                        ConnectionLog::DisconnectedAt,
                    ))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_connection_logs_client_id")
                            .from(ConnectionLog::Table, ConnectionLog::ClientId)
                            .to(Client::Table, Client::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_connection_logs_client_id")
                    .table(ConnectionLog::Table)
                    .col(ConnectionLog::ClientId)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 4. request_logs
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(RequestLog::Table)
                    .if_not_exists()
                    .col(pk_auto(RequestLog::Id))
                    .col(integer(RequestLog::ClientId).not_null())
                    .col(string_len(RequestLog::Model, 255).not_null())
                    .col(big_integer(RequestLog::DurationMs).not_null())
                    .col(
                        timestamp_with_time_zone(RequestLog::Timestamp)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_request_logs_client_id")
                            .from(RequestLog::Table, RequestLog::ClientId)
                            .to(Client::Table, Client::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_request_logs_client_id")
                    .table(RequestLog::Table)
                    .col(RequestLog::ClientId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(RequestLog::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ConnectionLog::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Client::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(User::Table).to_owned())
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum User {
    #[sea_orm(iden = "users")]
    Table,
    Id,
    Username,
    Email,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Client {
    #[sea_orm(iden = "clients")]
    Table,
    Id,
    UserId,
    ClientSlug,
    ApiKey,
    WhitelistedIps,
    CatchMode,
    LastSeenIp,
    HardwareInfo,
    AppUptime,
    CreatedAt,
}

#[derive(DeriveIden)]
enum ConnectionLog {
    #[sea_orm(iden = "connection_logs")]
    Table,
    Id,
    ClientId,
    ConnectedAt,
    DisconnectedAt,
}

#[derive(DeriveIden)]
enum RequestLog {
    #[sea_orm(iden = "request_logs")]
    Table,
    Id,
    ClientId,
    Model,
    DurationMs,
    Timestamp,
}
