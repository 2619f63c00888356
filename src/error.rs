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

// Gateway error types - structured responses with no information disclosure

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use thiserror::Error;
use tracing::debug;

use crate::constants::jsonrpc;
use crate::jsonrpc::{error_envelope, JsonRpcError};

/// Main error type for the gateway
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Spawn / IO failure on a transport (HTTP 500)
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed frame or body (HTTP 400)
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Unknown, missing or conflicting session (HTTP 400 / 409)
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// RPC-level error returned by the upstream service, never transformed
    #[error("Upstream error: {0}")]
    Upstream(JsonRpcError),

    /// Invalid gateway configuration
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transport level failures
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("already started")]
    AlreadyStarted,

    #[error("not started")]
    NotStarted,

    #[error("process closed")]
    ProcessClosed,

    #[error("transport closed")]
    Closed,

    #[error("transport is already tapped")]
    AlreadyTapped,

    #[error("inbound stream already taken")]
    InboundTaken,

    #[error("failed to spawn process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Framing / envelope errors. Recovered locally, never fatal to a connection.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    Json(String),

    #[error("not a JSON-RPC 2.0 envelope: {0}")]
    NotAnEnvelope(String),

    #[error("invalid UTF-8 in frame")]
    Utf8,

    #[error("frame of {0} bytes exceeds the size limit")]
    FrameTooLarge(usize),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("No valid session ID provided")]
    Missing,

    #[error("Session not found: {0}")]
    Unknown(String),

    #[error("Only one SSE stream is allowed per session")]
    StreamConflict,

    #[error("Session is closed")]
    Closed,
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Protocol(_) => StatusCode::BAD_REQUEST,
            GatewayError::Session(SessionError::StreamConflict) => StatusCode::CONFLICT,
            GatewayError::Session(_) => StatusCode::BAD_REQUEST,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON-RPC code carried in the HTTP error envelope.
    pub fn rpc_code(&self) -> i64 {
        match self {
            GatewayError::Protocol(ProtocolError::Json(_)) => jsonrpc::ERROR_PARSE,
            GatewayError::Protocol(_) => jsonrpc::ERROR_INVALID_REQUEST,
            GatewayError::Session(_) => jsonrpc::ERROR_BAD_REQUEST,
            GatewayError::Upstream(e) => e.code,
            _ => jsonrpc::ERROR_INTERNAL,
        }
    }

    /// Get user-friendly error message.
    pub fn user_message(&self) -> String {
        match self {
            GatewayError::Transport(_) => "Internal transport error".to_string(),
            GatewayError::Protocol(ProtocolError::Json(_)) => "Parse error".to_string(),
            GatewayError::Protocol(e) => format!("Invalid Request: {}", e),
            GatewayError::Session(e) => format!("Bad Request: {}", e),
            GatewayError::Upstream(e) => e.message.clone(),
            GatewayError::Config(_) => "Internal error".to_string(),
            GatewayError::Io(_) => "Internal system error".to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        debug!(error = %self, "Request failed");
        let status = self.status_code();
        let body = error_envelope(self.rpc_code(), &self.user_message());
        (status, Json(body)).into_response()
    }
}
