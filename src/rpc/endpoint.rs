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

//! Downstream-facing JSON-RPC endpoint.
//!
//! A method table plus a dispatch loop over one transport. Requests are
//! answered concurrently; unknown methods get `-32601 Method not found`.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::client::UpstreamClient;
use crate::constants::methods;
use crate::error::TransportError;
use crate::jsonrpc::{JsonRpcError, Message, Request, Response};
use crate::transport::{Transport, TransportEvent};

pub type HandlerResult = Result<Value, JsonRpcError>;
pub type MethodHandler = Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

#[derive(Default)]
struct Connection {
    transport: Mutex<Option<Arc<dyn Transport>>>,
    /// Upstream clients owned by this endpoint, closed with it.
    attached: Mutex<Vec<Arc<UpstreamClient>>>,
    closing: AtomicBool,
    closed: CancellationToken,
}

impl Connection {
    async fn shutdown(&self) -> Result<(), TransportError> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.closed.cancel();
        let transport = lock(&self.transport).take();
        let attached: Vec<_> = lock(&self.attached).drain(..).collect();

        let mut result = Ok(());
        if let Some(transport) = transport {
            result = transport.close().await;
        }
        for client in attached {
            if let Err(e) = client.close().await {
                warn!("Failed to close upstream client: {}", e);
            }
        }
        result
    }
}

pub struct RpcEndpoint {
    handlers: Arc<HashMap<String, MethodHandler>>,
    connection: Arc<Connection>,
}

impl Default for RpcEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcEndpoint {
    /// An endpoint that only knows `ping`.
    pub fn new() -> Self {
        let mut endpoint = Self {
            handlers: Arc::new(HashMap::new()),
            connection: Arc::new(Connection::default()),
        };
        endpoint.register(methods::PING, |_| async { Ok(json!({})) });
        endpoint
    }

    /// Register (or replace) the handler for `method`.
    pub fn register<F, Fut>(&mut self, method: impl Into<String>, handler: F)
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: MethodHandler = Arc::new(move |params| handler(params).boxed());
        Arc::make_mut(&mut self.handlers).insert(method.into(), handler);
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Tie an upstream client's lifetime to this endpoint. The endpoint
    /// closes when the client's connection goes away.
    pub fn attach(&mut self, client: Arc<UpstreamClient>) {
        self.close_when(client.closed());
        lock(&self.connection.attached).push(client);
    }

    /// Close this endpoint once `trigger` fires.
    pub fn close_when(&self, trigger: CancellationToken) {
        let connection = Arc::downgrade(&self.connection);
        let closed = self.connection.closed.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = closed.cancelled() => {}
                _ = trigger.cancelled() => {
                    if let Some(connection) = connection.upgrade() {
                        debug!("Upstream gone, closing endpoint");
                        let _ = connection.shutdown().await;
                    }
                }
            }
        });
    }

    /// Run one request through the method table.
    pub async fn handle(&self, request: Request) -> Response {
        dispatch(&self.handlers, request).await
    }

    /// Start `transport` and serve it until it closes or [`close`](Self::close)
    /// is called.
    pub async fn connect(&self, transport: Arc<dyn Transport>) -> Result<(), TransportError> {
        if self.connection.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let mut inbound = transport
            .take_inbound()
            .ok_or(TransportError::InboundTaken)?;
        *lock(&self.connection.transport) = Some(Arc::clone(&transport));
        transport.start().await?;

        let handlers = Arc::clone(&self.handlers);
        let connection = Arc::clone(&self.connection);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = connection.closed.cancelled() => break,
                    event = inbound.recv() => event,
                };
                match event {
                    Some(TransportEvent::Message(Message::Request(request))) => {
                        let handlers = Arc::clone(&handlers);
                        let transport = Arc::clone(&transport);
                        tokio::spawn(async move {
                            let response = dispatch(&handlers, request).await;
                            if let Err(e) = transport.send(Message::Response(response)).await {
                                debug!("Could not deliver response: {}", e);
                            }
                        });
                    }
                    Some(TransportEvent::Message(Message::Notification(notification))) => {
                        trace!(method = %notification.method, "Client notification");
                    }
                    Some(TransportEvent::Message(Message::Response(response))) => {
                        debug!(id = ?response.id, "Ignoring response from client");
                    }
                    Some(TransportEvent::Error(fault)) => {
                        warn!("Downstream transport error: {}", fault);
                    }
                    Some(TransportEvent::Closed) | None => {
                        debug!("Downstream transport closed");
                        let _ = connection.shutdown().await;
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    /// Close the transport and every attached upstream client. Idempotent.
    pub async fn close(&self) -> Result<(), TransportError> {
        self.connection.shutdown().await
    }

    pub fn is_closed(&self) -> bool {
        self.connection.closed.is_cancelled()
    }

    /// Fires when the endpoint closes, from either side.
    pub fn closed(&self) -> CancellationToken {
        self.connection.closed.clone()
    }
}

async fn dispatch(handlers: &HashMap<String, MethodHandler>, request: Request) -> Response {
    let Request {
        id, method, params, ..
    } = request;
    let Some(handler) = handlers.get(&method).cloned() else {
        debug!(%method, "Method not found");
        return Response::failure(Some(id), JsonRpcError::method_not_found(&method));
    };
    match handler(params).await {
        Ok(result) => Response::success(id, result),
        Err(error) => Response::failure(Some(id), error),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
