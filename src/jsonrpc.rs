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

//! JSON-RPC 2.0 envelopes.
//!
//! The gateway never interprets payloads. It only needs to tell requests,
//! responses and notifications apart so that it can correlate ids and route
//! replies, so classification looks at the envelope keys and nothing else.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::fmt;

use crate::constants::jsonrpc;
use crate::error::ProtocolError;

/// Request identifier. JSON-RPC allows numbers and strings. Numbers are
/// kept as serde_json numbers so fractional or unsigned ids echo back as sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(Number),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n.into())
    }
}

impl From<i32> for RequestId {
    fn from(n: i32) -> Self {
        RequestId::Number(n.into())
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            jsonrpc::ERROR_METHOD_NOT_FOUND,
            format!("Method not found: {}", method),
        )
    }

    pub fn connection_closed() -> Self {
        Self::new(jsonrpc::ERROR_CONNECTION_CLOSED, "Connection closed")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(jsonrpc::ERROR_INTERNAL, message)
    }
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: jsonrpc::VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: jsonrpc::VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// A response. `id` is `None` only for errors raised before the request id
/// could be read; it serializes as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: jsonrpc::VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: jsonrpc::VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Collapse into the `Result` the caller of the original request sees.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

/// Any JSON-RPC 2.0 envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

impl Message {
    /// Classify a decoded JSON value by its envelope keys.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(map) = value else {
            return Err(ProtocolError::NotAnEnvelope("expected a JSON object".into()));
        };
        match map.get("jsonrpc").and_then(Value::as_str) {
            Some(jsonrpc::VERSION) => {}
            _ => {
                return Err(ProtocolError::NotAnEnvelope(
                    "missing or unsupported \"jsonrpc\" version".into(),
                ))
            }
        }

        let has_method = map.contains_key("method");
        let has_id = map.get("id").is_some_and(|id| !id.is_null());
        let is_reply = map.contains_key("result") || map.contains_key("error");

        let decoded = match (has_method, has_id, is_reply) {
            (true, true, _) => from_map::<Request>(map).map(Message::Request),
            (true, false, _) => from_map::<Notification>(map).map(Message::Notification),
            (false, _, true) => from_map::<Response>(map).map(Message::Response),
            _ => {
                return Err(ProtocolError::NotAnEnvelope(
                    "neither a request, a notification nor a response".into(),
                ))
            }
        };
        decoded.map_err(|e| ProtocolError::NotAnEnvelope(e.to_string()))
    }

    pub fn parse_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| ProtocolError::Json(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(&r.method),
            Message::Notification(n) => Some(&n.method),
            Message::Response(_) => None,
        }
    }

    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Message::Request(r) => Some(&r.id),
            Message::Response(r) => r.id.as_ref(),
            Message::Notification(_) => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(_))
    }

    pub fn is_initialize_request(&self) -> bool {
        matches!(self, Message::Request(r) if r.method == crate::constants::methods::INITIALIZE)
    }

    /// Compact single-line JSON. serde_json escapes control characters inside
    /// strings, so the output never contains a raw newline.
    pub fn to_line(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Message::from_value(value).map_err(serde::de::Error::custom)
    }
}

impl From<Request> for Message {
    fn from(r: Request) -> Self {
        Message::Request(r)
    }
}

impl From<Notification> for Message {
    fn from(n: Notification) -> Self {
        Message::Notification(n)
    }
}

impl From<Response> for Message {
    fn from(r: Response) -> Self {
        Message::Response(r)
    }
}

fn from_map<T: serde::de::DeserializeOwned>(map: Map<String, Value>) -> serde_json::Result<T> {
    serde_json::from_value(Value::Object(map))
}

/// Decode an HTTP body holding one message or a JSON array batch.
pub fn parse_batch(bytes: &[u8]) -> Result<Vec<Message>, ProtocolError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Json(e.to_string()))?;
    match value {
        Value::Array(items) => {
            if items.is_empty() {
                return Err(ProtocolError::NotAnEnvelope("empty batch".into()));
            }
            items.into_iter().map(Message::from_value).collect()
        }
        other => Message::from_value(other).map(|m| vec![m]),
    }
}

/// The uniform error envelope used for every HTTP-level failure.
pub fn error_envelope(code: i64, message: &str) -> Value {
    serde_json::json!({
        "jsonrpc": jsonrpc::VERSION,
        "id": Value::Null,
        "error": { "code": code, "message": message }
    })
}
