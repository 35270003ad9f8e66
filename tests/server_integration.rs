//! Integration tests for the HTTP + WebSocket surface.
//!
//! Each test spins up an Axum server on a random port backed by an
//! in-memory database and a stub LLM, then drives it with reqwest and
//! tokio-tungstenite.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use rust_decimal::Decimal;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use ai_concierge::channels::{ChannelRegistry, WebChannel};
use ai_concierge::config::AgentConfig;
use ai_concierge::error::LlmError;
use ai_concierge::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
use ai_concierge::pipeline::{Normalizer, TriageRouter};
use ai_concierge::server::{AppState, app};
use ai_concierge::store::{Database, LibSqlBackend};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Stub LLM provider (no real API calls).
struct StubLlm;

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        "stub"
    }
    fn cost_per_token(&self) -> (Decimal, Decimal) {
        (Decimal::ZERO, Decimal::ZERO)
    }
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        Ok(CompletionResponse {
            content: "Hi! What's your name?".to_string(),
            input_tokens: 0,
            output_tokens: 0,
            finish_reason: FinishReason::Stop,
            response_id: None,
        })
    }
}

/// Start a server on a random port; returns the base URL.
async fn start_server() -> String {
    let config = AgentConfig {
        name: "Ada".into(),
        ..AgentConfig::default()
    };
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let web = WebChannel::new();
    let channels = ChannelRegistry::new().with(Arc::new(web.clone()));
    let state = AppState {
        normalizer: Arc::new(Normalizer::new(&config)),
        router: Arc::new(TriageRouter::new(&config, db, channels, Arc::new(StubLlm))),
    };
    let router = app(state, &web);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    format!("127.0.0.1:{port}")
}

fn web_message(message_id: &str, text: &str) -> Value {
    json!({
        "session_id": "s-1",
        "message_id": message_id,
        "user_id": "u-1",
        "user_name": "Jane",
        "text": text,
    })
}

async fn post_json(addr: &str, path: &str, body: &Value) -> (u16, Value) {
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}{path}"))
        .json(body)
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

fn parse_ws_json(msg: &Message) -> Value {
    match msg {
        Message::Text(txt) => serde_json::from_str(txt).expect("invalid JSON from server"),
        other => panic!("expected Text frame, got {:?}", other),
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_ok() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server().await;
        let body: Value = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn web_chat_reply_reaches_websocket_subscriber() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server().await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/ws/chat?thread_id=web:s-1"))
            .await
            .expect("WS connect failed");

        let (status, body) = post_json(&addr, "/api/chat", &web_message("c-1", "Hi")).await;
        assert_eq!(status, 200);
        assert_eq!(body["action"], "reply");
        assert_eq!(body["thread_id"], "web:s-1");
        assert_eq!(body["reply_text"], "Hi! What's your name?");

        let msg = ws.next().await.unwrap().unwrap();
        let event = parse_ws_json(&msg);
        assert_eq!(event["type"], "response");
        assert_eq!(event["thread_id"], "web:s-1");
        assert_eq!(event["message_id"], "reply:c-1");
        assert_eq!(event["content"], "Hi! What's your name?");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn duplicate_delivery_is_suppressed() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server().await;
        let message = web_message("c-1", "Hi");

        let (_, first) = post_json(&addr, "/api/chat", &message).await;
        let (status, second) = post_json(&addr, "/api/chat", &message).await;
        assert_eq!(first["action"], "reply");
        assert_eq!(status, 200);
        assert_eq!(second["action"], "suppressed");

        let history: Value = reqwest::get(format!("http://{addr}/api/chat/web:s-1/history"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let messages = history["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["sender_is_agent"], false);
        assert_eq!(messages[1]["sender_is_agent"], true);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn malformed_payloads_are_rejected() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server().await;

        let (status, body) =
            post_json(&addr, "/api/chat", &json!({"message_id": "c-1", "text": "Hi"})).await;
        assert_eq!(status, 400);
        assert!(body["error"].as_str().unwrap().contains("session_id"));

        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/webhooks/whatsapp"))
            .body("not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn whatsapp_reply_without_adapter_is_still_recorded() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server().await;
        let payload = json!({
            "message_id": "wamid.1",
            "chat_id": "15550001111@s.whatsapp.net",
            "chat_type": "user",
            "sender_phone": "+15550001111",
            "sender_name": "Jane",
            "from_me": false,
            "timestamp": 1767225600,
            "body": "Hi"
        });

        let (status, body) = post_json(&addr, "/webhooks/whatsapp", &payload).await;
        assert_eq!(status, 200);
        assert_eq!(body["action"], "reply");
        assert!(body["thread_id"].as_str().unwrap().starts_with("whatsapp:"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn sms_webhook_and_status_callback() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://{addr}/webhooks/sms"))
            .form(&[
                ("MessageSid", "SMin1"),
                ("From", "+15550001111"),
                ("To", "+15559990000"),
                ("Body", "Hello"),
            ])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["thread_id"], "sms:15550001111");

        let resp = client
            .post(format!("http://{addr}/webhooks/sms/status"))
            .form(&[("MessageSid", "SMout1"), ("MessageStatus", "delivered")])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "recorded");
    })
    .await
    .expect("test timed out");
}
