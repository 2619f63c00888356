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

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::info;

use crate::rpc::RpcEndpoint;
use crate::transport::sse::SseTransport;
use crate::transport::streamable::StreamableTransport;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Sse,
    Streamable,
}

/// The client-facing side of a session.
#[derive(Clone)]
pub enum Downstream {
    Sse(Arc<SseTransport>),
    Streamable(Arc<StreamableTransport>),
}

impl Downstream {
    pub fn kind(&self) -> SessionKind {
        match self {
            Downstream::Sse(_) => SessionKind::Sse,
            Downstream::Streamable(_) => SessionKind::Streamable,
        }
    }

    pub fn as_transport(&self) -> Arc<dyn Transport> {
        match self {
            Downstream::Sse(t) => t.clone(),
            Downstream::Streamable(t) => t.clone(),
        }
    }
}

/// What lifecycle hooks get to see of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub kind: SessionKind,
    pub created: DateTime<Utc>,
}

pub struct Session {
    pub id: String,
    pub created: DateTime<Utc>,
    downstream: Downstream,
    endpoint: RpcEndpoint,
    last_activity: Mutex<Instant>,
    closing: AtomicBool,
}

impl Session {
    pub fn new(id: impl Into<String>, downstream: Downstream, endpoint: RpcEndpoint) -> Self {
        Self {
            id: id.into(),
            created: Utc::now(),
            downstream,
            endpoint,
            last_activity: Mutex::new(Instant::now()),
            closing: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> SessionKind {
        self.downstream.kind()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            kind: self.kind(),
            created: self.created,
        }
    }

    pub fn endpoint(&self) -> &RpcEndpoint {
        &self.endpoint
    }

    pub fn sse(&self) -> Option<&Arc<SseTransport>> {
        match &self.downstream {
            Downstream::Sse(t) => Some(t),
            Downstream::Streamable(_) => None,
        }
    }

    pub fn streamable(&self) -> Option<&Arc<StreamableTransport>> {
        match &self.downstream {
            Downstream::Streamable(t) => Some(t),
            Downstream::Sse(_) => None,
        }
    }

    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    /// True for exactly one caller: the one that runs teardown.
    pub(crate) fn begin_close(&self) -> bool {
        !self.closing.swap(true, Ordering::SeqCst)
    }
}

/// Session lifecycle callbacks. Both are awaited before the request that
/// triggered them completes; `on_close` runs after the endpoint is closed.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    async fn on_connect(&self, _session: &SessionInfo, _endpoint: &RpcEndpoint) {}

    async fn on_close(&self, _session: &SessionInfo, _endpoint: &RpcEndpoint) {}
}

/// Default hooks: log and nothing else.
pub struct LoggingHooks;

#[async_trait]
impl SessionHooks for LoggingHooks {
    async fn on_connect(&self, session: &SessionInfo, _endpoint: &RpcEndpoint) {
        info!(session_id = %session.id, kind = ?session.kind, "Session opened");
    }

    async fn on_close(&self, session: &SessionInfo, _endpoint: &RpcEndpoint) {
        let lifetime = Utc::now() - session.created;
        info!(
            session_id = %session.id,
            kind = ?session.kind,
            lifetime_ms = lifetime.num_milliseconds(),
            "Session closed"
        );
    }
}
