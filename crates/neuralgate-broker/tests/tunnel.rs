//! End-to-end tests: a real listener, a WebSocket agent and HTTP callers

mod common;

use common::{fixture, open_policy, start_broker, ACCOUNT, SLUG};
use futures_util::{SinkExt, StreamExt};
use neuralgate_broker::BrokerConfig;
use neuralgate_proto::{AgentReply, AgentRequest};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};

type AgentSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn next_request(agent: &mut AgentSocket) -> AgentRequest {
    loop {
        match agent.next().await.expect("socket ended").expect("socket error") {
            Message::Text(text) => return AgentRequest::from_json(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message {:?}", other),
        }
    }
}

async fn send_reply(agent: &mut AgentSocket, reply: AgentReply) {
    agent
        .send(Message::Text(reply.to_json().unwrap().into()))
        .await
        .unwrap();
}

/// Read until a close frame arrives and return its code
async fn close_code(agent: &mut AgentSocket) -> u16 {
    loop {
        match agent.next().await {
            Some(Ok(Message::Close(Some(frame)))) => return u16::from(frame.code),
            Some(Ok(Message::Close(None))) | None => panic!("closed without a code"),
            Some(Ok(_)) => continue,
            Some(Err(e)) => panic!("socket error before close: {}", e),
        }
    }
}

fn generate_url(addr: std::net::SocketAddr) -> String {
    format!("http://{}/users/{}/{}/api/generate", addr, ACCOUNT, SLUG)
}

#[tokio::test]
async fn test_request_relayed_with_stream_forced_off() {
    let fixture = fixture(open_policy()).await;
    let key = fixture.credential.api_key.clone();
    let broker = start_broker(BrokerConfig::default(), &fixture).await;

    let (mut agent, _) = connect_async(broker.tunnel_url(ACCOUNT, SLUG, &key))
        .await
        .unwrap();
    broker.wait_online(1).await;

    let caller = tokio::spawn({
        let url = generate_url(broker.addr);
        let key = key.clone();
        async move {
            reqwest::Client::new()
                .post(url)
                .bearer_auth(key)
                .json(&json!({ "model": "llama3", "prompt": "hi", "stream": true }))
                .send()
                .await
                .unwrap()
        }
    });

    let request = next_request(&mut agent).await;
    assert_eq!(request.method, "POST");
    assert_eq!(request.path, "api/generate");
    assert_eq!(
        request.body,
        json!({ "model": "llama3", "prompt": "hi", "stream": false })
    );

    send_reply(
        &mut agent,
        AgentReply::new(request.request_id, 200, json!({ "response": "hello" })),
    )
    .await;

    let response = caller.await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({ "response": "hello" }));

    broker.shutdown.cancel();
}

#[tokio::test]
async fn test_agent_status_is_relayed() {
    let fixture = fixture(open_policy()).await;
    let key = fixture.credential.api_key.clone();
    let broker = start_broker(BrokerConfig::default(), &fixture).await;

    let (mut agent, _) = connect_async(broker.tunnel_url(ACCOUNT, SLUG, &key))
        .await
        .unwrap();
    broker.wait_online(1).await;

    let caller = tokio::spawn({
        let url = format!("http://{}/users/{}/{}/api/tags", broker.addr, ACCOUNT, SLUG);
        let key = key.clone();
        async move {
            reqwest::Client::new()
                .get(url)
                .bearer_auth(key)
                .send()
                .await
                .unwrap()
        }
    });

    let request = next_request(&mut agent).await;
    assert_eq!(request.method, "GET");
    assert_eq!(request.path, "api/tags");
    assert_eq!(request.body, Value::Null);

    send_reply(
        &mut agent,
        AgentReply::new(request.request_id, 404, json!({ "error": "model not found" })),
    )
    .await;

    let response = caller.await.unwrap();
    assert_eq!(response.status().as_u16(), 404);

    broker.shutdown.cancel();
}

#[tokio::test]
async fn test_loose_reply_statuses_settle_promptly() {
    let fixture = fixture(open_policy()).await;
    let key = fixture.credential.api_key.clone();
    let broker = start_broker(BrokerConfig::default(), &fixture).await;

    let (mut agent, _) = connect_async(broker.tunnel_url(ACCOUNT, SLUG, &key))
        .await
        .unwrap();
    broker.wait_online(1).await;

    for (status, expected) in [("null", 200), ("-1", 502), ("\"teapot\"", 502)] {
        let caller = tokio::spawn({
            let url = generate_url(broker.addr);
            let key = key.clone();
            async move {
                reqwest::Client::new()
                    .post(url)
                    .bearer_auth(key)
                    .json(&json!({ "model": "llama3" }))
                    .send()
                    .await
                    .unwrap()
            }
        });

        let request = next_request(&mut agent).await;
        let frame = format!(
            r#"{{"requestId":"{}","status":{},"data":{{"ok":true}}}}"#,
            request.request_id, status
        );
        agent.send(Message::Text(frame.into())).await.unwrap();

        let response = tokio::time::timeout(Duration::from_secs(5), caller)
            .await
            .expect("reply was not settled")
            .unwrap();
        assert_eq!(response.status().as_u16(), expected, "status {}", status);
    }

    broker.shutdown.cancel();
}

#[tokio::test]
async fn test_bad_credentials_close_with_policy_violation() {
    let fixture = fixture(open_policy()).await;
    let broker = start_broker(BrokerConfig::default(), &fixture).await;

    let (mut agent, _) = connect_async(broker.tunnel_url(ACCOUNT, SLUG, "sk-wrong"))
        .await
        .unwrap();

    assert_eq!(close_code(&mut agent).await, 1008);
    broker.wait_online(0).await;

    broker.shutdown.cancel();
}

#[tokio::test]
async fn test_newer_session_replaces_older() {
    let fixture = fixture(open_policy()).await;
    let key = fixture.credential.api_key.clone();
    let broker = start_broker(BrokerConfig::default(), &fixture).await;

    let (mut first, _) = connect_async(broker.tunnel_url(ACCOUNT, SLUG, &key))
        .await
        .unwrap();
    broker.wait_online(1).await;

    let (mut second, _) = connect_async(broker.tunnel_url(ACCOUNT, SLUG, &key))
        .await
        .unwrap();
    assert_eq!(close_code(&mut first).await, 4001);
    broker.wait_online(1).await;

    let caller = tokio::spawn({
        let url = generate_url(broker.addr);
        let key = key.clone();
        async move {
            reqwest::Client::new()
                .post(url)
                .bearer_auth(key)
                .json(&json!({ "model": "llama3" }))
                .send()
                .await
                .unwrap()
        }
    });

    let request = next_request(&mut second).await;
    send_reply(
        &mut second,
        AgentReply::new(request.request_id, 200, json!({ "from": "second" })),
    )
    .await;

    let body: Value = caller.await.unwrap().json().await.unwrap();
    assert_eq!(body, json!({ "from": "second" }));

    broker.shutdown.cancel();
}

#[tokio::test]
async fn test_silent_agent_yields_gateway_timeout() {
    let fixture = fixture(open_policy()).await;
    let key = fixture.credential.api_key.clone();
    let config = BrokerConfig {
        request_timeout: Duration::from_millis(200),
        ..BrokerConfig::default()
    };
    let broker = start_broker(config, &fixture).await;

    let (mut agent, _) = connect_async(broker.tunnel_url(ACCOUNT, SLUG, &key))
        .await
        .unwrap();
    broker.wait_online(1).await;

    let caller = tokio::spawn({
        let url = generate_url(broker.addr);
        let key = key.clone();
        async move {
            reqwest::Client::new()
                .post(url)
                .bearer_auth(key)
                .json(&json!({ "model": "llama3" }))
                .send()
                .await
                .unwrap()
        }
    });

    let request = next_request(&mut agent).await;

    let response = caller.await.unwrap();
    assert_eq!(response.status().as_u16(), 504);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Gateway Timeout: Hardware did not respond in time.");

    // A late reply is discarded without disturbing the session
    send_reply(
        &mut agent,
        AgentReply::new(request.request_id, 200, json!({ "late": true })),
    )
    .await;
    broker.wait_online(1).await;

    broker.shutdown.cancel();
}

#[tokio::test]
async fn test_concurrent_replies_matched_out_of_order() {
    let fixture = fixture(open_policy()).await;
    let key = fixture.credential.api_key.clone();
    let broker = start_broker(BrokerConfig::default(), &fixture).await;

    let (mut agent, _) = connect_async(broker.tunnel_url(ACCOUNT, SLUG, &key))
        .await
        .unwrap();
    broker.wait_online(1).await;

    let call = |model: &'static str| {
        let url = generate_url(broker.addr);
        let key = key.clone();
        tokio::spawn(async move {
            let response = reqwest::Client::new()
                .post(url)
                .bearer_auth(key)
                .json(&json!({ "model": model }))
                .send()
                .await
                .unwrap();
            response.json::<Value>().await.unwrap()
        })
    };

    let first = call("a");
    let second = call("b");

    let one = next_request(&mut agent).await;
    let two = next_request(&mut agent).await;

    // Answer in reverse arrival order, echoing each request's model
    for request in [two, one] {
        let model = request.body["model"].clone();
        send_reply(
            &mut agent,
            AgentReply::new(request.request_id, 200, json!({ "model": model })),
        )
        .await;
    }

    assert_eq!(first.await.unwrap(), json!({ "model": "a" }));
    assert_eq!(second.await.unwrap(), json!({ "model": "b" }));

    broker.shutdown.cancel();
}

#[tokio::test]
async fn test_agent_disconnect_fails_in_flight_request() {
    let fixture = fixture(open_policy()).await;
    let key = fixture.credential.api_key.clone();
    let broker = start_broker(BrokerConfig::default(), &fixture).await;

    let (mut agent, _) = connect_async(broker.tunnel_url(ACCOUNT, SLUG, &key))
        .await
        .unwrap();
    broker.wait_online(1).await;

    let caller = tokio::spawn({
        let url = generate_url(broker.addr);
        let key = key.clone();
        async move {
            reqwest::Client::new()
                .post(url)
                .bearer_auth(key)
                .json(&json!({ "model": "llama3" }))
                .send()
                .await
                .unwrap()
        }
    });

    next_request(&mut agent).await;
    agent.close(None).await.unwrap();
    drop(agent);

    let response = caller.await.unwrap();
    assert_eq!(response.status().as_u16(), 502);
    broker.wait_online(0).await;

    broker.shutdown.cancel();
}

#[tokio::test]
async fn test_shutdown_closes_agents_going_away() {
    let fixture = fixture(open_policy()).await;
    let key = fixture.credential.api_key.clone();
    let broker = start_broker(BrokerConfig::default(), &fixture).await;

    let (mut agent, _) = connect_async(broker.tunnel_url(ACCOUNT, SLUG, &key))
        .await
        .unwrap();
    broker.wait_online(1).await;

    broker.shutdown.cancel();
    assert_eq!(close_code(&mut agent).await, 1001);

    let result = tokio::time::timeout(Duration::from_secs(10), broker.handle)
        .await
        .expect("broker did not stop");
    assert!(result.unwrap().is_ok());
}
