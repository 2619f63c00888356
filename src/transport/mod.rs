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

//! Message transports.
//!
//! A transport moves JSON-RPC envelopes between the gateway and one peer:
//! the child process (`process`), an SSE client (`sse`) or a streamable HTTP
//! client (`streamable`). Outbound traffic goes through [`Transport::send`];
//! inbound traffic, errors and the final close are delivered in order on the
//! channel returned by [`Transport::take_inbound`].

pub mod codec;
pub mod process;
pub mod sse;
pub mod streamable;
pub mod tap;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::jsonrpc::Message;

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(Message),
    /// Non-fatal failure (malformed frame, write error). The transport stays up.
    Error(Arc<TransportFault>),
    /// Emitted exactly once, always last.
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportFault {
    #[error(transparent)]
    Protocol(#[from] crate::error::ProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type InboundReceiver = mpsc::UnboundedReceiver<TransportEvent>;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn start(&self) -> Result<(), TransportError>;

    async fn send(&self, message: Message) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    /// Hand out the inbound event stream. Only the first call gets it.
    fn take_inbound(&self) -> Option<InboundReceiver>;

    fn session_id(&self) -> Option<String> {
        None
    }

    fn is_tapped(&self) -> bool {
        false
    }
}

/// Inbound side shared by every transport implementation: an unbounded queue
/// plus the guard that makes `Closed` a one-shot.
pub(crate) struct Inbound {
    tx: mpsc::UnboundedSender<TransportEvent>,
    rx: Mutex<Option<InboundReceiver>>,
    closed: AtomicBool,
}

impl Inbound {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn take(&self) -> Option<InboundReceiver> {
        self.rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub(crate) fn message(&self, message: Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(TransportEvent::Message(message))
            .map_err(|_| TransportError::Closed)
    }

    pub(crate) fn error(&self, fault: impl Into<TransportFault>) {
        if !self.is_closed() {
            let _ = self.tx.send(TransportEvent::Error(Arc::new(fault.into())));
        }
    }

    /// Returns true for the caller that actually emitted the close.
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.tx.send(TransportEvent::Closed);
        true
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::Notification;

    #[tokio::test]
    async fn test_closed_is_emitted_once_and_last() {
        let inbound = Inbound::new();
        let mut rx = inbound.take().unwrap();
        assert!(inbound.take().is_none());

        inbound
            .message(Message::Notification(Notification::new("a", None)))
            .unwrap();
        assert!(inbound.close());
        assert!(!inbound.close());
        assert!(inbound
            .message(Message::Notification(Notification::new("b", None)))
            .is_err());

        assert!(matches!(rx.recv().await, Some(TransportEvent::Message(_))));
        assert!(matches!(rx.recv().await, Some(TransportEvent::Closed)));
        assert!(rx.try_recv().is_err());
    }
}
