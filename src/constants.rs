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

//! lilith-gateway constants - single source of truth for wire values.
//!
//! Error codes, header names, default routes and limits live here so the
//! transports, the router and the HTTP layer agree on them.

/// JSON-RPC 2.0 error codes
pub mod jsonrpc {
    pub const VERSION: &str = "2.0";
    /// Parse error (standard JSON-RPC)
    pub const ERROR_PARSE: i64 = -32700;
    /// Invalid request (standard JSON-RPC)
    pub const ERROR_INVALID_REQUEST: i64 = -32600;
    /// Method not found (standard JSON-RPC)
    pub const ERROR_METHOD_NOT_FOUND: i64 = -32601;
    /// Internal error (standard JSON-RPC)
    pub const ERROR_INTERNAL: i64 = -32603;
    /// Server-defined: bad request at the HTTP session layer
    pub const ERROR_BAD_REQUEST: i64 = -32000;
    /// Server-defined: upstream connection went away
    pub const ERROR_CONNECTION_CLOSED: i64 = -32000;
    /// Authentication failures carry the HTTP status as their code
    pub const ERROR_UNAUTHORIZED: i64 = 401;
}

/// HTTP header names (lowercase, as `http::HeaderName` expects)
pub mod headers {
    pub const API_KEY: &str = "x-api-key";
    pub const SESSION_ID: &str = "mcp-session-id";
    pub const LAST_EVENT_ID: &str = "last-event-id";
    pub const PROTOCOL_VERSION: &str = "mcp-protocol-version";
}

/// Default routes
pub mod routes {
    pub const HEALTH: &str = "/healthz";
    pub const SSE: &str = "/sse";
    pub const MESSAGE: &str = "/message";
    pub const STREAMABLE_HTTP: &str = "/mcp";
    /// Query parameter carrying the legacy session id
    pub const SESSION_QUERY_PARAM: &str = "sessionId";
    pub const HEALTH_BODY: &str = "ok";
}

/// OAuth protected resource challenge
pub mod oauth {
    pub const RESOURCE_METADATA_SUFFIX: &str = "/.well-known/oauth-protected-resource";
    pub const DEFAULT_ERROR: &str = "invalid_token";
    pub const DEFAULT_ERROR_DESCRIPTION: &str = "Authentication required";
}

/// MCP protocol methods the gateway knows by name
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const PING: &str = "ping";
    pub const LOGGING_SET_LEVEL: &str = "logging/setLevel";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_TEMPLATES_LIST: &str = "resources/templates/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
    pub const RESOURCES_UNSUBSCRIBE: &str = "resources/unsubscribe";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const COMPLETION_COMPLETE: &str = "completion/complete";
    /// Sent once on every new legacy SSE stream, after the endpoint event
    pub const SSE_CONNECTION: &str = "sse/connection";
    pub const SSE_CONNECTION_MESSAGE: &str = "SSE Connection established";
}

/// Protocol defaults
pub mod protocol {
    /// Protocol version announced when initializing the upstream
    pub const DEFAULT_VERSION: &str = "2024-11-05";
    pub const CLIENT_NAME: &str = "lilith-gateway";
}

/// Configuration environment variables
pub mod config {
    pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";
    pub const ENV_LOG_FORMAT: &str = "LOG_FORMAT";
    pub const ENV_API_KEY: &str = "LILITH_GATEWAY_API_KEY";
}

/// Transport limits (DoS protection)
pub mod limits {
    /// Maximum allowed JSON-RPC line / body size (10 MB)
    pub const MAX_MESSAGE_SIZE_BYTES: usize = 10 * 1024 * 1024;
    /// Rolling stderr capture kept per child process
    pub const STDERR_CAPTURE_BYTES: usize = 64 * 1024;
    /// Time a child gets between SIGTERM and SIGKILL
    pub const CLOSE_GRACE_MS: u64 = 2_000;
    /// Time the stdout reader gets to drain after the child has exited
    pub const READER_DRAIN_MS: u64 = 500;
    /// Plain-text error bodies read back when wrapping them in an envelope
    pub const MAX_REJECTION_BODY_BYTES: usize = 4 * 1024;
}
