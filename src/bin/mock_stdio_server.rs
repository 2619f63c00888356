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

//! Minimal stdio MCP server for integration tests.
//!
//! Declares the `resources` and `tools` capabilities, exposes one resource
//! (`mock://greeting`) and one `echo` tool. Anything written to stderr is
//! diagnostics only.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_util::codec::{FramedRead, FramedWrite};

use lilith_gateway::constants::{methods, protocol};
use lilith_gateway::jsonrpc::{JsonRpcError, Message, Request, Response};
use lilith_gateway::transport::codec::{Frame, NdjsonCodec};

#[tokio::main]
async fn main() {
    let mut input = FramedRead::new(tokio::io::stdin(), NdjsonCodec::new());
    let mut output = FramedWrite::new(tokio::io::stdout(), NdjsonCodec::new());

    while let Some(frame) = input.next().await {
        let message = match frame {
            Ok(Frame::Message(message)) => message,
            Ok(Frame::Malformed(error)) => {
                eprintln!("mock: skipping malformed line: {}", error);
                continue;
            }
            Err(e) => {
                eprintln!("mock: read error: {}", e);
                break;
            }
        };
        let Message::Request(request) = message else {
            continue;
        };
        let response = Message::Response(answer(request));
        if output.send(&response).await.is_err() {
            break;
        }
    }
}

fn answer(request: Request) -> Response {
    let Request {
        id, method, params, ..
    } = request;
    let result = match method.as_str() {
        methods::INITIALIZE => Ok(json!({
            "protocolVersion": protocol::DEFAULT_VERSION,
            "capabilities": {"resources": {}, "tools": {}},
            "serverInfo": {"name": "mock-stdio-server", "version": env!("CARGO_PKG_VERSION")}
        })),
        methods::PING => Ok(json!({})),
        methods::RESOURCES_LIST => Ok(json!({
            "resources": [{
                "uri": "mock://greeting",
                "name": "greeting",
                "mimeType": "text/plain"
            }]
        })),
        methods::RESOURCES_READ => Ok(json!({
            "contents": [{"uri": "mock://greeting", "mimeType": "text/plain", "text": "hello"}]
        })),
        methods::TOOLS_LIST => Ok(json!({
            "tools": [{
                "name": "echo",
                "description": "Returns its arguments",
                "inputSchema": {"type": "object"}
            }]
        })),
        methods::TOOLS_CALL => {
            let arguments = params
                .as_ref()
                .and_then(|p| p.get("arguments"))
                .cloned()
                .unwrap_or(Value::Null);
            Ok(json!({"content": [{"type": "text", "text": arguments.to_string()}]}))
        }
        other => Err(JsonRpcError::method_not_found(other)),
    };
    match result {
        Ok(result) => Response::success(id, result),
        Err(error) => Response::failure(Some(id), error),
    }
}
