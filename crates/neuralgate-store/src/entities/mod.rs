//! Database entities

pub mod client;
pub mod connection_log;
pub mod request_log;
pub mod user;

pub use client::Entity as Client;
pub use connection_log::Entity as ConnectionLog;
pub use request_log::Entity as RequestLog;
pub use user::Entity as User;

pub mod prelude {
    pub use super::client::Entity as Client;
    pub use super::connection_log::Entity as ConnectionLog;
    pub use super::request_log::Entity as RequestLog;
    pub use super::user::Entity as User;
}
