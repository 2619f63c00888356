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

//! Endpoint factories.
//!
//! The gateway asks a factory for a fresh, fully wired [`RpcEndpoint`] for
//! every session (and for every request in stateless mode).

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use super::client::{RpcClient, UpstreamClient};
use super::endpoint::RpcEndpoint;
use crate::constants::methods;
use crate::error::GatewayError;
use crate::router::{CapabilitySnapshot, MessageRouter};
use crate::transport::process::{ProcessCommand, ProcessTransport};
use crate::transport::tap::{TapSink, TappedTransport};
use crate::transport::Transport;

#[async_trait]
pub trait EndpointFactory: Send + Sync {
    async fn create(&self) -> Result<RpcEndpoint, GatewayError>;
}

/// Endpoint that answers `initialize` with the upstream's own result and
/// forwards everything else through the router.
pub fn build_endpoint(client: Arc<dyn RpcClient>, initialize_result: &Value) -> RpcEndpoint {
    let mut endpoint = RpcEndpoint::new();
    let result = initialize_result.clone();
    endpoint.register(methods::INITIALIZE, move |_params| {
        let result = result.clone();
        async move { Ok(result) }
    });
    let snapshot = CapabilitySnapshot::from_initialize_result(initialize_result);
    MessageRouter::new(client, snapshot).wire(&mut endpoint);
    endpoint
}

/// Every endpoint forwards to one already-initialized upstream connection.
pub struct SharedUpstream {
    client: Arc<UpstreamClient>,
    initialize_result: Value,
}

impl SharedUpstream {
    /// Connect and initialize `transport`.
    pub async fn connect(transport: Arc<dyn Transport>) -> Result<Self, GatewayError> {
        let client = UpstreamClient::connect(transport).await?;
        let initialize_result = client
            .initialize()
            .await
            .map_err(GatewayError::Upstream)?;
        Ok(Self {
            client,
            initialize_result,
        })
    }

    pub fn client(&self) -> &Arc<UpstreamClient> {
        &self.client
    }
}

#[async_trait]
impl EndpointFactory for SharedUpstream {
    async fn create(&self) -> Result<RpcEndpoint, GatewayError> {
        if self.client.is_closed() {
            return Err(GatewayError::Upstream(
                crate::jsonrpc::JsonRpcError::connection_closed(),
            ));
        }
        let endpoint = build_endpoint(self.client.clone(), &self.initialize_result);
        endpoint.close_when(self.client.closed());
        Ok(endpoint)
    }
}

/// Every endpoint gets its own child process, closed with the endpoint.
pub struct ProcessPerEndpoint {
    command: ProcessCommand,
    tap: Option<TapSink>,
}

impl ProcessPerEndpoint {
    pub fn new(command: ProcessCommand) -> Self {
        Self { command, tap: None }
    }

    /// Mirror every spawned process transport onto `sink`.
    pub fn with_tap(mut self, sink: TapSink) -> Self {
        self.tap = Some(sink);
        self
    }
}

#[async_trait]
impl EndpointFactory for ProcessPerEndpoint {
    async fn create(&self) -> Result<RpcEndpoint, GatewayError> {
        let process: Arc<dyn Transport> = Arc::new(ProcessTransport::new(self.command.clone()));
        let transport: Arc<dyn Transport> = match &self.tap {
            Some(sink) => Arc::new(TappedTransport::wrap("upstream", process, sink.clone())?),
            None => process,
        };
        debug!(program = %self.command.program, "Spawning upstream for new endpoint");

        let client = UpstreamClient::connect(transport).await?;
        let initialize_result = match client.initialize().await {
            Ok(result) => result,
            Err(e) => {
                let _ = client.close().await;
                return Err(GatewayError::Upstream(e));
            }
        };
        info!("Per-endpoint upstream ready");

        let mut endpoint = build_endpoint(client.clone(), &initialize_result);
        endpoint.attach(client);
        Ok(endpoint)
    }
}
