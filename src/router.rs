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

//! Capability-gated method forwarding.
//!
//! | Capability  | Methods forwarded                                         |
//! |-------------|-----------------------------------------------------------|
//! | `logging`   | `logging/setLevel`                                        |
//! | `prompts`   | `prompts/list`, `prompts/get`                             |
//! | `resources` | `resources/list`, `resources/templates/list`,             |
//! |             | `resources/read`, `resources/subscribe`,                  |
//! |             | `resources/unsubscribe`                                   |
//! | `tools`     | `tools/list`, `tools/call`                                |
//! | (always)    | `completion/complete`                                     |
//!
//! Params go up and results come back untouched, upstream errors included.
//! Anything not in the table is left to the endpoint's "method not found".

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::constants::methods;
use crate::rpc::{RpcClient, RpcEndpoint};

/// Which method groups the upstream declared in its initialize result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySnapshot {
    pub logging: bool,
    pub prompts: bool,
    pub resources: bool,
    pub tools: bool,
}

impl CapabilitySnapshot {
    /// A group counts as present when its key exists under `capabilities`,
    /// whatever its value.
    pub fn from_initialize_result(result: &Value) -> Self {
        let capabilities = result.get("capabilities");
        let has = |group: &str| capabilities.and_then(|c| c.get(group)).is_some();
        Self {
            logging: has("logging"),
            prompts: has("prompts"),
            resources: has("resources"),
            tools: has("tools"),
        }
    }

    /// Methods wired for this snapshot, in registration order.
    pub fn forwarded_methods(&self) -> Vec<&'static str> {
        let mut wired = Vec::new();
        if self.logging {
            wired.push(methods::LOGGING_SET_LEVEL);
        }
        if self.prompts {
            wired.extend([methods::PROMPTS_LIST, methods::PROMPTS_GET]);
        }
        if self.resources {
            wired.extend([
                methods::RESOURCES_LIST,
                methods::RESOURCES_TEMPLATES_LIST,
                methods::RESOURCES_READ,
                methods::RESOURCES_SUBSCRIBE,
                methods::RESOURCES_UNSUBSCRIBE,
            ]);
        }
        if self.tools {
            wired.extend([methods::TOOLS_LIST, methods::TOOLS_CALL]);
        }
        // Completion is wired unconditionally.
        wired.push(methods::COMPLETION_COMPLETE);
        wired
    }
}

pub struct MessageRouter {
    client: Arc<dyn RpcClient>,
    snapshot: CapabilitySnapshot,
}

impl MessageRouter {
    pub fn new(client: Arc<dyn RpcClient>, snapshot: CapabilitySnapshot) -> Self {
        Self { client, snapshot }
    }

    pub fn wire(&self, endpoint: &mut RpcEndpoint) {
        let wired = self.snapshot.forwarded_methods();
        for &method in &wired {
            let client = Arc::clone(&self.client);
            endpoint.register(method, move |params| {
                let client = Arc::clone(&client);
                async move { client.call(method, params).await }
            });
        }
        debug!(snapshot = ?self.snapshot, methods = wired.len(), "Router wired");
    }
}
