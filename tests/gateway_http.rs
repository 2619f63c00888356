// Copyright 2026 BadCompany
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// HTTP routing tests against the in-process router (no sockets, no child processes).

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::response::Response;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use common::{parse_sse, CountingHooks, EchoFactory, SseReader};
use lilith_gateway::auth::{AuthConfig, OAuthChallenge};
use lilith_gateway::config::GatewayConfig;
use lilith_gateway::jsonrpc::{Message, Notification};
use lilith_gateway::transport::Transport;
use lilith_gateway::SessionGateway;

const KEY: &str = "test-key";

fn gateway(config: GatewayConfig) -> (SessionGateway, Arc<CountingHooks>) {
    let hooks = Arc::new(CountingHooks::default());
    let gateway = SessionGateway::builder(config, Arc::new(EchoFactory))
        .hooks(hooks.clone())
        .build()
        .unwrap();
    (gateway, hooks)
}

fn with_key() -> GatewayConfig {
    GatewayConfig {
        auth: AuthConfig {
            api_key: Some(KEY.into()),
            oauth: None,
        },
        ..Default::default()
    }
}

fn json_mode() -> GatewayConfig {
    GatewayConfig {
        json_response: true,
        ..Default::default()
    }
}

async fn send(gateway: &SessionGateway, request: Request<Body>) -> Response {
    gateway.router().oneshot(request).await.unwrap()
}

async fn body_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn post_json(uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::ACCEPT, "application/json, text/event-stream")
}

fn rpc(id: i64, method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
}

fn initialize(id: i64) -> Value {
    rpc(
        id,
        "initialize",
        json!({"protocolVersion": "2024-11-05", "capabilities": {}, "clientInfo": {"name": "t", "version": "1"}}),
    )
}

fn session_id(response: &Response) -> Option<String> {
    response
        .headers()
        .get("mcp-session-id")
        .map(|v| v.to_str().unwrap().to_string())
}

#[tokio::test]
async fn test_health_bypasses_auth() {
    let (gateway, _) = gateway(with_key());
    let response = send(
        &gateway,
        Request::get("/healthz").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "ok");
}

#[tokio::test]
async fn test_preflight_needs_no_credentials() {
    let (gateway, _) = gateway(with_key());
    let response = send(
        &gateway,
        Request::builder()
            .method(Method::OPTIONS)
            .uri("/mcp")
            .header(header::ORIGIN, "https://a.example")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "https://a.example"
    );
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_CREDENTIALS],
        "true"
    );
}

#[tokio::test]
async fn test_missing_key_gets_challenge_with_cors() {
    let mut config = with_key();
    config.auth.oauth = Some(OAuthChallenge {
        realm: Some("mcp".into()),
        ..Default::default()
    });
    let (gateway, hooks) = gateway(config);

    let response = send(
        &gateway,
        post_json("/mcp")
            .header(header::ORIGIN, "https://a.example")
            .body(Body::from(initialize(1).to_string()))
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "https://a.example"
    );
    assert!(response.headers()[header::WWW_AUTHENTICATE]
        .to_str()
        .unwrap()
        .starts_with("Bearer realm=\"mcp\""));
    let body = body_json(response).await;
    assert_eq!(body["jsonrpc"], "2.0");
    assert!(body["id"].is_null());
    assert_eq!(body["error"]["code"], 401);

    // Rejected before any session work.
    assert_eq!(hooks.connects(), 0);
    assert!(gateway.sessions().is_empty().await);
}

#[tokio::test]
async fn test_valid_key_reaches_routing() {
    let mut config = with_key();
    config.json_response = true;
    let (gateway, _) = gateway(config);
    let response = send(
        &gateway,
        post_json("/mcp")
            .header("x-api-key", KEY)
            .body(Body::from(initialize(1).to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_legacy_post_needs_known_session() {
    let (gateway, _) = gateway(GatewayConfig::default());
    let ping = rpc(1, "ping", json!({})).to_string();

    let missing = send(
        &gateway,
        post_json("/message")
            .body(Body::from(ping.clone()))
            .unwrap(),
    )
    .await;
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(missing).await["error"]["code"], -32000);

    let unknown = send(
        &gateway,
        post_json("/message?sessionId=nope")
            .body(Body::from(ping))
            .unwrap(),
    )
    .await;
    assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_path_is_enveloped_404() {
    let (gateway, _) = gateway(GatewayConfig::default());
    let response = send(&gateway, Request::get("/nope").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(body_json(response).await["error"]["code"].is_i64());
}

#[tokio::test]
async fn test_streamable_requires_initialize_or_session() {
    let (gateway, _) = gateway(json_mode());

    let response = send(
        &gateway,
        post_json("/mcp")
            .body(Body::from(rpc(1, "tools/list", json!({})).to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(
        &gateway,
        post_json("/mcp")
            .header("mcp-session-id", "does-not-exist")
            .body(Body::from(rpc(1, "tools/list", json!({})).to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(&gateway, Request::get("/mcp").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_streamable_json_session_lifecycle() {
    let (gateway, hooks) = gateway(json_mode());

    let response = send(
        &gateway,
        post_json("/mcp")
            .body(Body::from(initialize(1).to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let id = session_id(&response).expect("session header");
    let body = body_json(response).await;
    assert_eq!(body["id"], 1);
    assert_eq!(body["result"]["serverInfo"]["name"], "echo");
    assert_eq!(hooks.connects(), 1);
    assert_eq!(gateway.sessions().len().await, 1);

    // Batch in, array out.
    let batch = json!([
        rpc(2, "tools/call", json!({"name": "x"})),
        rpc(3, "prompts/list", json!({})),
        {"jsonrpc": "2.0", "method": "notifications/initialized"}
    ]);
    let response = send(
        &gateway,
        post_json("/mcp")
            .header("mcp-session-id", &id)
            .body(Body::from(batch.to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let replies = body_json(response).await;
    let replies = replies.as_array().unwrap();
    assert_eq!(replies.len(), 2);
    let call = replies.iter().find(|r| r["id"] == 2).unwrap();
    assert_eq!(call["result"]["method"], "tools/call");
    let prompts = replies.iter().find(|r| r["id"] == 3).unwrap();
    assert_eq!(prompts["error"]["code"], -32601);

    // Notifications only: accepted, no body to wait for.
    let response = send(
        &gateway,
        post_json("/mcp")
            .header("mcp-session-id", &id)
            .body(Body::from(
                json!({"jsonrpc": "2.0", "method": "notifications/cancelled"}).to_string(),
            ))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = send(
        &gateway,
        Request::delete("/mcp")
            .header("mcp-session-id", &id)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(hooks.closes(), 1);
    assert!(gateway.sessions().is_empty().await);

    // Gone for good.
    let response = send(
        &gateway,
        Request::delete("/mcp")
            .header("mcp-session-id", &id)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(hooks.closes(), 1);
}

#[tokio::test]
async fn test_streamable_sse_response_ends_after_answers() {
    let (gateway, _) = gateway(GatewayConfig::default());
    let response = send(
        &gateway,
        post_json("/mcp")
            .body(Body::from(initialize(7).to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(session_id(&response).is_some());
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let events = parse_sse(&body_text(response).await);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event.as_deref(), Some("message"));
    // Every event on a resumable session carries an id.
    assert!(events[0].id.is_some());
    assert_eq!(events[0].json()["id"], 7);
}

#[tokio::test]
async fn test_second_standalone_stream_conflicts() {
    let (gateway, _) = gateway(json_mode());
    let response = send(
        &gateway,
        post_json("/mcp")
            .body(Body::from(initialize(1).to_string()))
            .unwrap(),
    )
    .await;
    let id = session_id(&response).unwrap();

    let first = send(
        &gateway,
        Request::get("/mcp")
            .header("mcp-session-id", &id)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(first.status(), StatusCode::OK);

    let second = send(
        &gateway,
        Request::get("/mcp")
            .header("mcp-session-id", &id)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(second.status(), StatusCode::CONFLICT);
    drop(first);
}

#[tokio::test]
async fn test_stateless_requests_share_nothing() {
    let (gateway, hooks) = gateway(GatewayConfig {
        stateless: true,
        json_response: true,
        ..Default::default()
    });

    for id in 1..=2 {
        let response = send(
            &gateway,
            post_json("/mcp")
                .body(Body::from(initialize(id).to_string()))
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(session_id(&response).is_none());
        assert_eq!(body_json(response).await["id"], id);
    }
    assert!(gateway.sessions().is_empty().await);
    assert_eq!(hooks.connects(), 0);

    let response = send(&gateway, Request::get("/mcp").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    let response = send(&gateway, Request::delete("/mcp").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_malformed_body_is_parse_error() {
    let (gateway, _) = gateway(json_mode());
    let response = send(
        &gateway,
        post_json("/mcp")
            .body(Body::from("{not json"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"]["code"], -32700);
}

#[tokio::test]
async fn test_legacy_sse_round_trip_and_teardown() {
    let (gateway, hooks) = gateway(GatewayConfig::default());

    let response = send(&gateway, Request::get("/sse").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let mut reader = SseReader::new(response.into_body().into_data_stream());

    let endpoint = reader.next_event().await.expect("endpoint event");
    assert_eq!(endpoint.event.as_deref(), Some("endpoint"));
    assert!(endpoint.data.starts_with("/message?sessionId="));
    assert_eq!(hooks.connects(), 1);
    assert_eq!(gateway.sessions().len().await, 1);

    // The connection announcement follows the endpoint event.
    let established = reader.next_event().await.expect("connection event");
    assert_eq!(established.event.as_deref(), Some("message"));
    let established = established.json();
    assert_eq!(established["method"], "sse/connection");
    assert_eq!(established["params"]["message"], "SSE Connection established");
    assert!(established.get("id").is_none());

    let response = send(
        &gateway,
        post_json(&endpoint.data)
            .body(Body::from(rpc(5, "tools/list", json!({})).to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(body_text(response).await, "Accepted");

    let reply = reader.next_event().await.expect("response event");
    assert_eq!(reply.event.as_deref(), Some("message"));
    assert_eq!(reply.json()["id"], 5);
    assert_eq!(reply.json()["result"]["method"], "tools/list");

    // Client goes away.
    drop(reader);
    let closed = common::eventually(Duration::from_secs(5), || hooks.closes() == 1).await;
    assert!(closed);
    assert!(gateway.sessions().is_empty().await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hooks.closes(), 1);
}

#[tokio::test]
async fn test_close_all_sessions_runs_hooks() {
    let (gateway, hooks) = gateway(json_mode());
    for id in 1..=3 {
        send(
            &gateway,
            post_json("/mcp")
                .body(Body::from(initialize(id).to_string()))
                .unwrap(),
        )
        .await;
    }
    assert_eq!(gateway.sessions().len().await, 3);
    gateway.close_all_sessions().await;
    assert_eq!(hooks.closes(), 3);
    assert!(gateway.sessions().is_empty().await);
}

#[tokio::test]
async fn test_wrong_method_on_legacy_routes_is_enveloped() {
    let (gateway, _) = gateway(GatewayConfig::default());
    for (method, uri) in [(Method::POST, "/sse"), (Method::GET, "/message")] {
        let response = send(
            &gateway,
            Request::builder()
                .method(method)
                .uri(uri)
                .header(header::ORIGIN, "https://a.example")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://a.example"
        );
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("application/json"));
        let body = body_json(response).await;
        assert_eq!(body["jsonrpc"], "2.0");
        assert!(body["id"].is_null());
        assert_eq!(body["error"]["code"], -32000);
        assert!(!body["error"]["message"].as_str().unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_oversized_body_is_enveloped_413() {
    let (gateway, hooks) = gateway(GatewayConfig::default());
    let oversized = vec![b' '; 11 * 1024 * 1024];

    // With and without a declared length.
    for declared in [true, false] {
        let mut request = post_json("/message?sessionId=whatever");
        if declared {
            request = request.header(header::CONTENT_LENGTH, oversized.len());
        }
        let response = send(
            &gateway,
            request.body(Body::from(oversized.clone())).unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body = body_json(response).await;
        assert_eq!(body["jsonrpc"], "2.0");
        assert!(body["id"].is_null());
        assert_eq!(body["error"]["code"], -32000);
    }
    assert_eq!(hooks.connects(), 0);
}

fn open_standalone(session: &str, last_event_id: Option<&str>) -> Request<Body> {
    let mut request = Request::get("/mcp").header("mcp-session-id", session);
    if let Some(last) = last_event_id {
        request = request.header("last-event-id", last);
    }
    request.body(Body::empty()).unwrap()
}

fn progress(n: u64) -> Message {
    Message::Notification(Notification::new(
        "notifications/progress",
        Some(json!({ "n": n })),
    ))
}

#[tokio::test]
async fn test_standalone_stream_resumes_from_last_event_id() {
    let (gateway, _) = gateway(json_mode());
    let response = send(
        &gateway,
        post_json("/mcp")
            .body(Body::from(initialize(1).to_string()))
            .unwrap(),
    )
    .await;
    let id = session_id(&response).unwrap();
    let session = gateway.sessions().get(&id).await.unwrap();
    let transport = Arc::clone(session.streamable().unwrap());

    let response = send(&gateway, open_standalone(&id, None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let mut first = SseReader::new(response.into_body().into_data_stream());
    for n in 1..=2 {
        transport.send(progress(n)).await.unwrap();
    }
    for n in 1..=2u64 {
        let event = first.next_event().await.expect("live event");
        assert_eq!(event.id, Some(format!("standalone_{}", n)));
        assert_eq!(event.json()["params"]["n"], n);
    }

    // Client drops; the server keeps talking.
    drop(first);
    for n in 3..=4 {
        transport.send(progress(n)).await.unwrap();
    }

    let response = send(&gateway, open_standalone(&id, Some("standalone_2"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(session_id(&response).as_deref(), Some(id.as_str()));
    let mut resumed = SseReader::new(response.into_body().into_data_stream());
    transport.send(progress(5)).await.unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        let event = resumed.next_event().await.expect("resumed event");
        let n = event.json()["params"]["n"].as_u64().unwrap();
        seen.push((event.id.unwrap(), n));
    }
    assert_eq!(
        seen,
        vec![
            ("standalone_3".to_string(), 3),
            ("standalone_4".to_string(), 4),
            ("standalone_5".to_string(), 5),
        ]
    );
}
