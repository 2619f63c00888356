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

// Shared helpers for integration tests. Not every test binary uses all of them.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lilith_gateway::error::GatewayError;
use lilith_gateway::gateway::{SessionHooks, SessionInfo};
use lilith_gateway::jsonrpc::JsonRpcError;
use lilith_gateway::rpc::factory::build_endpoint;
use lilith_gateway::rpc::{EndpointFactory, RpcClient, RpcEndpoint};
use lilith_gateway::transport::process::ProcessCommand;

pub fn mock_server() -> ProcessCommand {
    ProcessCommand::new(env!("CARGO_BIN_EXE_mock-stdio-server"))
}

/// Upstream stand-in: answers every call with the method and params it got.
pub struct EchoClient;

#[async_trait]
impl RpcClient for EchoClient {
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, JsonRpcError> {
        Ok(json!({ "method": method, "params": params }))
    }
}

/// Endpoints backed by [`EchoClient`], advertising tools only.
pub struct EchoFactory;

pub fn echo_initialize_result() -> Value {
    json!({
        "protocolVersion": "2024-11-05",
        "capabilities": {"tools": {}},
        "serverInfo": {"name": "echo", "version": "0.0.0"}
    })
}

#[async_trait]
impl EndpointFactory for EchoFactory {
    async fn create(&self) -> Result<RpcEndpoint, GatewayError> {
        Ok(build_endpoint(Arc::new(EchoClient), &echo_initialize_result()))
    }
}

/// Counts hook invocations.
#[derive(Default)]
pub struct CountingHooks {
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
}

impl CountingHooks {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionHooks for CountingHooks {
    async fn on_connect(&self, _session: &SessionInfo, _endpoint: &RpcEndpoint) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_close(&self, _session: &SessionInfo, endpoint: &RpcEndpoint) {
        assert!(endpoint.is_closed(), "on_close must run after the endpoint closed");
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Poll `condition` until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn json(&self) -> Value {
        serde_json::from_str(&self.data).unwrap()
    }
}

/// Parse every complete event in `text`. Comments (keep-alives) are skipped.
pub fn parse_sse(text: &str) -> Vec<SseEvent> {
    text.replace("\r\n", "\n")
        .split("\n\n")
        .filter_map(parse_block)
        .collect()
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = SseEvent::default();
    let mut data = Vec::new();
    for line in block.lines() {
        if line.starts_with(':') || line.is_empty() {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event.event = Some(value.to_string()),
            "id" => event.id = Some(value.to_string()),
            "data" => data.push(value.to_string()),
            _ => {}
        }
    }
    if data.is_empty() && event.event.is_none() {
        return None;
    }
    event.data = data.join("\n");
    Some(event)
}

type ByteStream<E> = Pin<Box<dyn Stream<Item = Result<Bytes, E>> + Send>>;

/// Incremental reader over a streaming response body.
pub struct SseReader<E> {
    body: ByteStream<E>,
    buffer: String,
}

impl<E: std::fmt::Debug> SseReader<E> {
    pub fn new(body: impl Stream<Item = Result<Bytes, E>> + Send + 'static) -> Self {
        Self {
            body: Box::pin(body),
            buffer: String::new(),
        }
    }

    /// Next event, or `None` when the stream ends, fails or 5 s pass.
    pub async fn next_event(&mut self) -> Option<SseEvent> {
        loop {
            while let Some(end) = self.buffer.find("\n\n") {
                let block: String = self.buffer.drain(..end + 2).collect();
                if let Some(event) = parse_block(&block) {
                    return Some(event);
                }
            }
            let chunk = tokio::time::timeout(Duration::from_secs(5), self.body.next())
                .await
                .ok()??
                .ok()?;
            self.buffer
                .push_str(&String::from_utf8_lossy(&chunk).replace("\r\n", "\n"));
        }
    }
}
