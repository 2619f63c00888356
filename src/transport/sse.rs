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

//! Legacy SSE downstream transport.
//!
//! The client holds a GET event stream open and POSTs its messages to a
//! companion URL. Outbound messages are queued as [`SseFrame`]s and rendered
//! into the event stream by [`SseStream`]; POSTed messages enter through
//! [`SseTransport::deliver`].

use async_trait::async_trait;
use axum::response::sse::Event;
use futures::Stream;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::debug;

use super::{Inbound, InboundReceiver, Transport};
use crate::error::TransportError;
use crate::jsonrpc::Message;

/// One server-sent event, before rendering.
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    /// Where the client must POST its messages.
    Endpoint(String),
    Message {
        id: Option<String>,
        message: Message,
    },
}

impl SseFrame {
    pub fn into_event(self) -> Event {
        match self {
            SseFrame::Endpoint(url) => Event::default().event("endpoint").data(url),
            SseFrame::Message { id, message } => {
                let data = serde_json::to_string(&message).unwrap_or_else(|e| {
                    // Message is plain data; this only fires on a broken Value.
                    tracing::error!("Failed to serialize outbound message: {}", e);
                    String::from("{}")
                });
                let event = Event::default().event("message").data(data);
                match id {
                    Some(id) => event.id(id),
                    None => event,
                }
            }
        }
    }
}

/// Event stream body for an SSE response.
///
/// Ends when the transport drops its sender or `cancel` fires. `on_drop` runs
/// when the response body is dropped, which is how a client disconnect is
/// observed.
pub struct SseStream {
    frames: mpsc::UnboundedReceiver<SseFrame>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl SseStream {
    pub fn new(frames: mpsc::UnboundedReceiver<SseFrame>, cancel: CancellationToken) -> Self {
        Self {
            frames,
            cancelled: Box::pin(cancel.cancelled_owned()),
            on_drop: None,
        }
    }

    pub fn on_drop(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_drop = Some(Box::new(callback));
        self
    }
}

impl Stream for SseStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(None);
        }
        this.frames
            .poll_recv(cx)
            .map(|frame| frame.map(|frame| Ok(frame.into_event())))
    }
}

impl Drop for SseStream {
    fn drop(&mut self) {
        if let Some(callback) = self.on_drop.take() {
            callback();
        }
    }
}

pub struct SseTransport {
    session_id: String,
    endpoint_url: String,
    inbound: Inbound,
    outbound: Mutex<Option<mpsc::UnboundedSender<SseFrame>>>,
    frames: Mutex<Option<mpsc::UnboundedReceiver<SseFrame>>>,
    started: AtomicBool,
}

impl SseTransport {
    /// `endpoint_url` is announced to the client as-is on start.
    pub fn new(session_id: impl Into<String>, endpoint_url: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            session_id: session_id.into(),
            endpoint_url: endpoint_url.into(),
            inbound: Inbound::new(),
            outbound: Mutex::new(Some(tx)),
            frames: Mutex::new(Some(rx)),
            started: AtomicBool::new(false),
        }
    }

    /// The outbound frame queue, for the GET response body. Only once.
    pub fn take_frames(&self) -> Option<mpsc::UnboundedReceiver<SseFrame>> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Hand a message POSTed by the client to the endpoint.
    pub fn deliver(&self, message: Message) -> Result<(), TransportError> {
        self.inbound.message(message)
    }

    fn push(&self, frame: SseFrame) -> Result<(), TransportError> {
        let outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = outbound.as_ref() else {
            return Err(TransportError::Closed);
        };
        tx.send(frame).map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn start(&self) -> Result<(), TransportError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyStarted);
        }
        debug!(session_id = %self.session_id, endpoint = %self.endpoint_url, "SSE stream started");
        self.push(SseFrame::Endpoint(self.endpoint_url.clone()))
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        self.push(SseFrame::Message { id: None, message })
    }

    async fn close(&self) -> Result<(), TransportError> {
        // Dropping the sender ends the response stream.
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if self.inbound.close() {
            debug!(session_id = %self.session_id, "SSE transport closed");
        }
        Ok(())
    }

    fn take_inbound(&self) -> Option<InboundReceiver> {
        self.inbound.take()
    }

    fn session_id(&self) -> Option<String> {
        Some(self.session_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::{Request, Response};
    use crate::transport::TransportEvent;
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_endpoint_frame_comes_first() {
        let transport = SseTransport::new("abc", "/message?sessionId=abc");
        let mut frames = transport.take_frames().unwrap();
        transport.start().await.unwrap();
        transport
            .send(Message::Response(Response::success(1.into(), json!({}))))
            .await
            .unwrap();

        assert_eq!(
            frames.recv().await,
            Some(SseFrame::Endpoint("/message?sessionId=abc".into()))
        );
        assert!(matches!(frames.recv().await, Some(SseFrame::Message { id: None, .. })));
        assert!(matches!(
            transport.start().await,
            Err(TransportError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_close_ends_stream_and_rejects_sends() {
        let transport = SseTransport::new("abc", "/m");
        let frames = transport.take_frames().unwrap();
        let mut inbound = transport.take_inbound().unwrap();
        transport
            .deliver(Message::Request(Request::new(1, "ping", None)))
            .unwrap();
        transport.close().await.unwrap();

        let mut stream = SseStream::new(frames, CancellationToken::new());
        assert!(stream.next().await.is_none());
        assert!(transport
            .send(Message::Request(Request::new(2, "ping", None)))
            .await
            .is_err());
        assert!(matches!(inbound.recv().await, Some(TransportEvent::Message(_))));
        assert!(matches!(inbound.recv().await, Some(TransportEvent::Closed)));
    }

    #[tokio::test]
    async fn test_stream_drop_runs_callback_once() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let cancel = CancellationToken::new();
        let mut stream = SseStream::new(rx, cancel.clone()).on_drop(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        cancel.cancel();
        assert!(stream.next().await.is_none());
        drop(stream);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
