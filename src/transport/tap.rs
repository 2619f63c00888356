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

//! Diagnostic wrapper that mirrors transport activity onto a side channel.
//!
//! `TappedTransport` delegates every call to the wrapped transport untouched
//! and publishes a [`TapEvent`] for it. Inbound events are forwarded through a
//! single task, so their order is preserved.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{InboundReceiver, Transport, TransportEvent};
use crate::error::TransportError;
use crate::jsonrpc::Message;

#[derive(Debug, Clone, PartialEq)]
pub enum TapEventKind {
    Start,
    Send(Message),
    Inbound(Message),
    Error(String),
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TapEvent {
    pub label: String,
    pub kind: TapEventKind,
}

pub type TapSink = mpsc::UnboundedSender<TapEvent>;

pub struct TappedTransport {
    label: String,
    inner: Arc<dyn Transport>,
    sink: TapSink,
    closed: Arc<AtomicBool>,
}

impl TappedTransport {
    /// Wrap `inner`. A transport that is already tapped is rejected.
    pub fn wrap(
        label: impl Into<String>,
        inner: Arc<dyn Transport>,
        sink: TapSink,
    ) -> Result<Self, TransportError> {
        if inner.is_tapped() {
            return Err(TransportError::AlreadyTapped);
        }
        Ok(Self {
            label: label.into(),
            inner,
            sink,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn publish(&self, kind: TapEventKind) {
        publish(&self.sink, &self.label, &self.closed, kind);
    }
}

fn publish(sink: &TapSink, label: &str, closed: &AtomicBool, kind: TapEventKind) {
    // Close is reported once, whichever side saw it first.
    if kind == TapEventKind::Close && closed.swap(true, Ordering::SeqCst) {
        return;
    }
    let _ = sink.send(TapEvent {
        label: label.to_string(),
        kind,
    });
}

#[async_trait]
impl Transport for TappedTransport {
    async fn start(&self) -> Result<(), TransportError> {
        self.publish(TapEventKind::Start);
        self.inner.start().await
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        self.publish(TapEventKind::Send(message.clone()));
        self.inner.send(message).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.publish(TapEventKind::Close);
        self.inner.close().await
    }

    fn take_inbound(&self) -> Option<InboundReceiver> {
        let mut upstream = self.inner.take_inbound()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = self.sink.clone();
        let label = self.label.clone();
        let closed = Arc::clone(&self.closed);

        tokio::spawn(async move {
            while let Some(event) = upstream.recv().await {
                let kind = match &event {
                    TransportEvent::Message(message) => TapEventKind::Inbound(message.clone()),
                    TransportEvent::Error(fault) => TapEventKind::Error(fault.to_string()),
                    TransportEvent::Closed => TapEventKind::Close,
                };
                publish(&sink, &label, &closed, kind);
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
        Some(rx)
    }

    fn session_id(&self) -> Option<String> {
        self.inner.session_id()
    }

    fn is_tapped(&self) -> bool {
        true
    }
}

/// Drain a tap sink into the log until every sender is gone.
pub async fn log_tap_events(mut events: mpsc::UnboundedReceiver<TapEvent>) {
    while let Some(event) = events.recv().await {
        let label = event.label.as_str();
        match event.kind {
            TapEventKind::Start => debug!(transport = label, "tap: start"),
            TapEventKind::Send(message) => {
                debug!(transport = label, method = ?message.method(), id = ?message.id(), "tap: send")
            }
            TapEventKind::Inbound(message) => {
                debug!(transport = label, method = ?message.method(), id = ?message.id(), "tap: inbound")
            }
            TapEventKind::Error(error) => warn!(transport = label, %error, "tap: error"),
            TapEventKind::Close => debug!(transport = label, "tap: close"),
        }
    }
}
