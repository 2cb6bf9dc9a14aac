//! Shared fixtures for broker integration tests

#![allow(dead_code)]

use neuralgate_broker::{Broker, BrokerConfig};
use neuralgate_store::{connect, migrate, AccessPolicy, ClientCredential, SqlDatastore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const ACCOUNT: &str = "alice";
pub const SLUG: &str = "gpu1";

pub struct Fixture {
    pub store: Arc<SqlDatastore>,
    pub credential: ClientCredential,
}

/// In-memory store holding `alice/gpu1` under the given policy
pub async fn fixture(policy: AccessPolicy) -> Fixture {
    let db = connect("sqlite::memory:")
        .await
        .expect("Failed to connect to in-memory database");
    migrate(&db).await.expect("Failed to run migrations");

    let store = SqlDatastore::new(db);
    let account = store.create_account(ACCOUNT, None).await.unwrap();
    let credential = store.create_client(account, SLUG, &policy).await.unwrap();

    Fixture {
        store: Arc::new(store),
        credential,
    }
}

pub fn open_policy() -> AccessPolicy {
    AccessPolicy {
        whitelist: vec!["*".to_string()],
        catch_mode: false,
    }
}

pub struct RunningBroker {
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<Result<(), anyhow::Error>>,
}

impl RunningBroker {
    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn tunnel_url(&self, username: &str, slug: &str, key: &str) -> String {
        format!(
            "ws://{}/tunnel?username={}&slug={}&key={}",
            self.addr, username, slug, key
        )
    }

    /// Poll `/health` until `count` agents are online
    pub async fn wait_online(&self, count: u64) {
        let client = reqwest::Client::new();
        for _ in 0..100 {
            let health: serde_json::Value = client
                .get(self.http_url("/health"))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if health["agents_online"].as_u64() == Some(count) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("agents_online never reached {}", count);
    }
}

/// Serve a broker on an ephemeral localhost port
pub async fn start_broker(config: BrokerConfig, fixture: &Fixture) -> RunningBroker {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();

    let broker = Broker::new(config, fixture.store.clone());
    let handle = tokio::spawn(broker.serve(listener, shutdown.clone()));

    RunningBroker {
        addr,
        shutdown,
        handle,
    }
}
