use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use viewsync::hub::{Envelope, EnvelopeType};
use viewsync::llm::{BackendError, ModelBackend};
use viewsync::{ServerError, ViewSyncConfig, ViewSyncServer};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Always answers with a six-column layout change.
struct LayoutBackend;

#[async_trait]
impl ModelBackend for LayoutBackend {
    fn name(&self) -> &str {
        "layout"
    }

    async fn complete(&self, _prompt: &str) -> Result<String, BackendError> {
        Ok(r#"Switched to six columns. {"action":"update_layout","data":{"columns":6}}"#.to_string())
    }
}

struct Running {
    server: Arc<ViewSyncServer>,
    addr: SocketAddr,
    task: JoinHandle<Result<(), ServerError>>,
}

async fn start_server() -> Running {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let server = Arc::new(ViewSyncServer::new(
        ViewSyncConfig::default(),
        Arc::new(LayoutBackend),
    ));
    let task = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };
    Running { server, addr, task }
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("websocket handshake");
    client
}

/// Next envelope from the server, skipping transport-level frames.
async fn next_envelope(client: &mut Client) -> Envelope {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("frame within 5s")
            .expect("stream open")
            .expect("valid frame");
        if let Message::Text(text) = message {
            return Envelope::from_json(&text).expect("envelope");
        }
    }
}

async fn send(client: &mut Client, envelope: Value) {
    client
        .send(Message::Text(envelope.to_string()))
        .await
        .expect("send");
}

#[tokio::test]
async fn connect_receives_state_and_ping_gets_pong() {
    let running = start_server().await;
    let mut client = connect(running.addr).await;

    let first = next_envelope(&mut client).await;
    assert_eq!(first.kind(), EnvelopeType::StateReplace);
    assert_eq!(first.data()["layout"]["columns"], 12);
    assert_eq!(first.data()["components"], json!([]));

    send(&mut client, json!({"type": "ping", "data": {}})).await;
    let reply = next_envelope(&mut client).await;
    assert_eq!(reply.kind(), EnvelopeType::Pong);

    running.server.stop();
}

#[tokio::test]
async fn chat_message_broadcasts_update_then_replies_to_sender() {
    let running = start_server().await;
    let mut sender = connect(running.addr).await;
    let mut watcher = connect(running.addr).await;
    next_envelope(&mut sender).await;
    next_envelope(&mut watcher).await;

    send(
        &mut sender,
        json!({"type": "chat_message", "data": {"message": "six columns please"}}),
    )
    .await;

    let update = next_envelope(&mut sender).await;
    assert_eq!(update.kind(), EnvelopeType::LiveUpdate);
    assert_eq!(update.action(), Some("update_layout"));
    assert_eq!(update.data()["columns"], 6);

    let reply = next_envelope(&mut sender).await;
    assert_eq!(reply.kind(), EnvelopeType::ChatResponse);
    assert_eq!(reply.data()["response"], "Switched to six columns.");
    assert_eq!(reply.action(), Some("update_layout"));

    let seen = next_envelope(&mut watcher).await;
    assert_eq!(seen.kind(), EnvelopeType::LiveUpdate);
    assert_eq!(seen.data()["columns"], 6);

    running.server.stop();
}

#[tokio::test]
async fn late_joiner_gets_current_state() {
    let running = start_server().await;
    let mut early = connect(running.addr).await;
    next_envelope(&mut early).await;

    send(
        &mut early,
        json!({
            "type": "view_update",
            "action": "add_component",
            "data": {
                "type": "card",
                "category": "composite",
                "properties": {"title": "Hello"},
                "size": {"w": 200, "h": 120}
            }
        }),
    )
    .await;
    let added = next_envelope(&mut early).await;
    assert_eq!(added.action(), Some("add_component"));

    let mut late = connect(running.addr).await;
    let snapshot = next_envelope(&mut late).await;
    assert_eq!(snapshot.kind(), EnvelopeType::StateReplace);
    assert_eq!(snapshot.data()["components"][0]["type"], "card");
    assert_eq!(snapshot.data()["components"][0]["position"]["x"], 40);

    running.server.stop();
}

#[tokio::test]
async fn http_surface_reports_health_state_and_chats() {
    let running = start_server().await;
    let base = format!("http://{}", running.addr);
    let http = reqwest::Client::new();

    let health: Value = http
        .get(format!("{base}/health"))
        .send()
        .await
        .expect("health")
        .json()
        .await
        .expect("health json");
    assert_eq!(health["ok"], true);
    assert_eq!(health["clients"], 0);

    let chat: Value = http
        .post(format!("{base}/api/chat"))
        .json(&json!({"message": "six columns"}))
        .send()
        .await
        .expect("chat")
        .json()
        .await
        .expect("chat json");
    assert_eq!(chat["response"], "Switched to six columns.");
    assert_eq!(chat["action"], "update_layout");

    let state: Value = http
        .get(format!("{base}/api/state"))
        .send()
        .await
        .expect("state")
        .json()
        .await
        .expect("state json");
    assert_eq!(state["layout"]["columns"], 6);

    running.server.stop();
}

#[tokio::test]
async fn stop_closes_clients_and_ends_serving() {
    let running = start_server().await;
    let mut client = connect(running.addr).await;
    next_envelope(&mut client).await;

    running.server.stop();

    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "client was not closed");

    let served = tokio::time::timeout(Duration::from_secs(5), running.task)
        .await
        .expect("server stops within 5s")
        .expect("server task joins");
    assert!(served.is_ok());
    assert_eq!(running.server.hub().client_count(), 0);
}
