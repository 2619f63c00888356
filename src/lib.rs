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

//! lilith-gateway: serve a stdio MCP server over HTTP.
//!
//! A child process speaking newline-delimited JSON-RPC on its standard
//! streams is exposed to many concurrent clients over the legacy SSE
//! transport and the streamable HTTP transport, with per-session
//! multiplexing, resumable streams, API key auth and CORS.

pub mod auth;
pub mod config;
pub mod constants;
pub mod error;
pub mod event_log;
pub mod gateway;
pub mod jsonrpc;
pub mod router;
pub mod rpc;
pub mod transport;

pub use error::{GatewayError, ProtocolError, SessionError, TransportError};
pub use gateway::{GatewayHandle, SessionGateway};
