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

//! Upstream JSON-RPC client.
//!
//! Correlates responses to calls purely by request id. Every session that
//! shares the upstream goes through one client, which mints the ids, so ids
//! never collide on the wire.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::{methods, protocol};
use crate::error::TransportError;
use crate::jsonrpc::{JsonRpcError, Message, Notification, Request, RequestId, Response};
use crate::transport::{InboundReceiver, Transport, TransportEvent};

type PendingCall = oneshot::Sender<Result<Value, JsonRpcError>>;
type PendingMap = Arc<Mutex<HashMap<RequestId, PendingCall>>>;

/// The calls the router makes. Implemented by [`UpstreamClient`] and by test
/// doubles.
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, JsonRpcError>;
}

pub struct UpstreamClient {
    transport: Arc<dyn Transport>,
    pending: PendingMap,
    next_id: AtomicI64,
    closed: CancellationToken,
}

impl UpstreamClient {
    /// Start `transport` and begin reading its inbound stream.
    pub async fn connect(transport: Arc<dyn Transport>) -> Result<Arc<Self>, TransportError> {
        let inbound = transport
            .take_inbound()
            .ok_or(TransportError::InboundTaken)?;
        let client = Arc::new(Self {
            transport: Arc::clone(&transport),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicI64::new(1),
            closed: CancellationToken::new(),
        });

        tokio::spawn(pump(
            inbound,
            Arc::clone(&client.pending),
            Arc::clone(&transport),
            client.closed.clone(),
        ));

        if let Err(e) = transport.start().await {
            // Closing ends the pump.
            let _ = transport.close().await;
            return Err(e);
        }
        Ok(client)
    }

    /// `initialize` handshake followed by `notifications/initialized`.
    /// Returns the server's initialize result untouched.
    pub async fn initialize(&self) -> Result<Value, JsonRpcError> {
        let params = json!({
            "protocolVersion": protocol::DEFAULT_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": protocol::CLIENT_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            }
        });
        let result = self.call(methods::INITIALIZE, Some(params)).await?;
        self.notify(methods::INITIALIZED, None)
            .await
            .map_err(|e| transport_failure(&e))?;
        let server = result
            .pointer("/serverInfo/name")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let protocol_version = result
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        info!(server, protocol_version, "Upstream initialized");
        Ok(result)
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        self.transport
            .send(Message::Notification(Notification::new(method, params)))
            .await
    }

    pub async fn close(&self) -> Result<(), TransportError> {
        self.transport.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Fires once the upstream connection is gone.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn pending_calls(&self) -> usize {
        lock(&self.pending).len()
    }
}

#[async_trait]
impl RpcClient for UpstreamClient {
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let id = RequestId::from(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id.clone(), tx);
        // The pump cancels before it drains, so either it sees this entry or
        // this check sees the cancellation.
        if self.closed.is_cancelled() {
            lock(&self.pending).remove(&id);
            return Err(JsonRpcError::connection_closed());
        }

        let request = Message::Request(Request::new(id.clone(), method, params));
        if let Err(e) = self.transport.send(request).await {
            lock(&self.pending).remove(&id);
            return Err(transport_failure(&e));
        }

        rx.await
            .unwrap_or_else(|_| Err(JsonRpcError::connection_closed()))
    }
}

fn transport_failure(e: &TransportError) -> JsonRpcError {
    match e {
        TransportError::ProcessClosed | TransportError::Closed | TransportError::NotStarted => {
            JsonRpcError::connection_closed()
        }
        other => JsonRpcError::internal(other.to_string()),
    }
}

async fn pump(
    mut inbound: InboundReceiver,
    pending: PendingMap,
    transport: Arc<dyn Transport>,
    closed: CancellationToken,
) {
    while let Some(event) = inbound.recv().await {
        match event {
            TransportEvent::Message(Message::Response(response)) => {
                let Some(id) = response.id.clone() else {
                    warn!(error = ?response.error, "Upstream sent an error with no id");
                    continue;
                };
                match lock(&pending).remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(response.into_result());
                    }
                    None => debug!(%id, "Response for unknown request id"),
                }
            }
            TransportEvent::Message(Message::Request(request)) => {
                // Server-to-client requests are not supported by the gateway.
                debug!(method = %request.method, "Rejecting request from upstream");
                let reply = Response::failure(
                    Some(request.id),
                    JsonRpcError::method_not_found(&request.method),
                );
                let transport = Arc::clone(&transport);
                tokio::spawn(async move {
                    let _ = transport.send(Message::Response(reply)).await;
                });
            }
            TransportEvent::Message(Message::Notification(notification)) => {
                debug!(method = %notification.method, "Upstream notification");
            }
            TransportEvent::Error(fault) => {
                warn!("Upstream transport error: {}", fault);
            }
            TransportEvent::Closed => break,
        }
    }

    closed.cancel();
    let orphaned: Vec<PendingCall> = lock(&pending).drain().map(|(_, tx)| tx).collect();
    if !orphaned.is_empty() {
        warn!(calls = orphaned.len(), "Upstream closed with calls in flight");
    }
    for tx in orphaned {
        let _ = tx.send(Err(JsonRpcError::connection_closed()));
    }
    info!("Upstream connection closed");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
