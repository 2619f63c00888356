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

//! Streamable HTTP downstream transport.
//!
//! Each POST that carries requests gets its own response stream, which ends
//! once every one of those requests has been answered. Messages the server
//! sends on its own (notifications, server requests) go to the standalone
//! stream opened by GET, or are dropped when none is open.
//!
//! With an [`EventLog`] attached every outbound message is logged under its
//! stream id before it is pushed, and the log append plus the push happen
//! under the same lock that [`StreamableTransport::open_standalone`] replays
//! under, so a resuming client sees no gap and no duplicate.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::sse::SseFrame;
use super::{Inbound, InboundReceiver, Transport};
use crate::error::{SessionError, TransportError};
use crate::event_log::{format_event_id, parse_event_id, EventLog};
use crate::jsonrpc::{Message, RequestId};

/// Stream id of the GET stream.
pub const STANDALONE_STREAM_ID: &str = "standalone";

#[derive(Default)]
struct Streams {
    open: HashMap<String, mpsc::UnboundedSender<SseFrame>>,
    /// Which stream answers which request.
    routes: HashMap<RequestId, String>,
    /// Unanswered requests per request stream.
    outstanding: HashMap<String, usize>,
}

pub struct StreamableTransport {
    session_id: Option<String>,
    events: Option<Arc<EventLog>>,
    inbound: Inbound,
    streams: Mutex<Streams>,
    started: AtomicBool,
}

impl StreamableTransport {
    /// `session_id` is `None` in stateless mode. Without `events` nothing is
    /// logged and GET streams cannot be resumed.
    pub fn new(session_id: Option<String>, events: Option<Arc<EventLog>>) -> Self {
        Self {
            session_id,
            events,
            inbound: Inbound::new(),
            streams: Mutex::new(Streams::default()),
            started: AtomicBool::new(false),
        }
    }

    pub fn is_resumable(&self) -> bool {
        self.events.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.inbound.is_closed()
    }

    fn lock(&self) -> MutexGuard<'_, Streams> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a response stream for the requests of one POST. Must happen
    /// before the requests are delivered, or early answers find no route.
    pub fn open_request_stream(
        &self,
        request_ids: &[RequestId],
    ) -> Result<mpsc::UnboundedReceiver<SseFrame>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let stream_id = uuid::Uuid::new_v4().simple().to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut streams = self.lock();
        for id in request_ids {
            streams.routes.insert(id.clone(), stream_id.clone());
        }
        streams.outstanding.insert(stream_id.clone(), request_ids.len());
        streams.open.insert(stream_id.clone(), tx);
        trace!(stream_id = %stream_id, requests = request_ids.len(), "Opened request stream");
        Ok(rx)
    }

    /// Open the standalone GET stream. With `last_event_id`, everything the
    /// log holds after that position is queued first.
    pub fn open_standalone(
        &self,
        last_event_id: Option<&str>,
    ) -> Result<mpsc::UnboundedReceiver<SseFrame>, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let mut streams = self.lock();
        if streams
            .open
            .get(STANDALONE_STREAM_ID)
            .is_some_and(|tx| !tx.is_closed())
        {
            return Err(SessionError::StreamConflict);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if let (Some(events), Some(raw)) = (&self.events, last_event_id) {
            match parse_event_id(raw) {
                Some((stream_id, after)) => {
                    let mut replayed = 0usize;
                    events.replay(&stream_id, after, |event| {
                        replayed += 1;
                        let _ = tx.send(SseFrame::Message {
                            id: Some(format_event_id(&event.stream_id, event.event_id)),
                            message: event.message.clone(),
                        });
                    });
                    debug!(stream_id = %stream_id, after, replayed, "Replayed events on reconnect");
                }
                None => debug!(last_event_id = raw, "Ignoring unparseable Last-Event-ID"),
            }
        }
        streams.open.insert(STANDALONE_STREAM_ID.to_string(), tx);
        Ok(rx)
    }

    /// Hand a message POSTed by the client to the endpoint.
    pub fn deliver(&self, message: Message) -> Result<(), TransportError> {
        self.inbound.message(message)
    }

    /// Whether a client is currently holding the standalone GET stream.
    pub fn has_standalone(&self) -> bool {
        self.lock()
            .open
            .get(STANDALONE_STREAM_ID)
            .is_some_and(|tx| !tx.is_closed())
    }
}

#[async_trait]
impl Transport for StreamableTransport {
    async fn start(&self) -> Result<(), TransportError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyStarted);
        }
        Ok(())
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut streams = self.lock();

        let (stream_id, answers_request) = match &message {
            Message::Response(response) => {
                match response.id.as_ref().and_then(|id| streams.routes.remove(id)) {
                    Some(stream_id) => (stream_id, true),
                    None => {
                        debug!(id = ?response.id, "Dropping response with no open request stream");
                        return Ok(());
                    }
                }
            }
            _ => (STANDALONE_STREAM_ID.to_string(), false),
        };

        let Some(tx) = streams.open.get(&stream_id).cloned() else {
            // No standalone stream: server-initiated messages have nowhere to go.
            trace!(method = ?message.method(), "No standalone stream, dropping message");
            return Ok(());
        };

        let id = self
            .events
            .as_ref()
            .map(|events| format_event_id(&stream_id, events.append(&stream_id, message.clone())));
        if tx.send(SseFrame::Message { id, message }).is_err() {
            debug!(stream_id = %stream_id, "Client left the stream before delivery");
        }

        if answers_request {
            let done = match streams.outstanding.get_mut(&stream_id) {
                Some(left) => {
                    *left = left.saturating_sub(1);
                    *left == 0
                }
                None => true,
            };
            if done {
                // Dropping the last sender ends the POST response.
                streams.outstanding.remove(&stream_id);
                streams.open.remove(&stream_id);
                trace!(stream_id = %stream_id, "Request stream complete");
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        {
            let mut streams = self.lock();
            streams.open.clear();
            streams.routes.clear();
            streams.outstanding.clear();
        }
        if self.inbound.close() {
            debug!(session_id = ?self.session_id, "Streamable transport closed");
        }
        Ok(())
    }

    fn take_inbound(&self) -> Option<InboundReceiver> {
        self.inbound.take()
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::{Notification, Response};
    use serde_json::json;

    fn reply(id: i64) -> Message {
        Message::Response(Response::success(id.into(), json!({"n": id})))
    }

    fn progress() -> Message {
        Message::Notification(Notification::new("notifications/progress", None))
    }

    #[tokio::test]
    async fn test_request_stream_closes_after_all_answers() {
        let transport = StreamableTransport::new(Some("s".into()), None);
        let mut rx = transport
            .open_request_stream(&[1.into(), 2.into()])
            .unwrap();

        transport.send(reply(2)).await.unwrap();
        transport.send(reply(1)).await.unwrap();

        assert!(matches!(rx.recv().await, Some(SseFrame::Message { message, .. }) if message.id() == Some(&2.into())));
        assert!(matches!(rx.recv().await, Some(SseFrame::Message { message, .. }) if message.id() == Some(&1.into())));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_notifications_need_standalone_stream() {
        let transport = StreamableTransport::new(Some("s".into()), None);
        transport.send(progress()).await.unwrap();

        let mut standalone = transport.open_standalone(None).unwrap();
        transport.send(progress()).await.unwrap();
        assert!(matches!(
            standalone.recv().await,
            Some(SseFrame::Message { id: None, .. })
        ));
        assert!(standalone.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_second_standalone_conflicts_until_first_leaves() {
        let transport = StreamableTransport::new(Some("s".into()), None);
        let first = transport.open_standalone(None).unwrap();
        assert_eq!(
            transport.open_standalone(None).unwrap_err(),
            SessionError::StreamConflict
        );
        drop(first);
        assert!(transport.open_standalone(None).is_ok());
    }

    #[tokio::test]
    async fn test_has_standalone_tracks_the_client() {
        let transport = StreamableTransport::new(Some("s".into()), None);
        assert!(!transport.has_standalone());
        let stream = transport.open_standalone(None).unwrap();
        assert!(transport.has_standalone());
        drop(stream);
        assert!(!transport.has_standalone());
    }

    #[tokio::test]
    async fn test_resume_replays_after_last_event_id() {
        let events = Arc::new(EventLog::new());
        let transport = StreamableTransport::new(Some("s".into()), Some(events.clone()));

        let first = transport.open_standalone(None).unwrap();
        for _ in 0..3 {
            transport.send(progress()).await.unwrap();
        }
        drop(first);

        let mut resumed = transport.open_standalone(Some("standalone_1")).unwrap();
        transport.send(progress()).await.unwrap();

        let mut ids = Vec::new();
        while let Ok(SseFrame::Message { id, .. }) = resumed.try_recv() {
            ids.push(id.unwrap());
        }
        assert_eq!(ids, vec!["standalone_2", "standalone_3", "standalone_4"]);
        assert_eq!(events.last_event_id(STANDALONE_STREAM_ID), 4);
    }

    #[tokio::test]
    async fn test_close_ends_every_stream() {
        let transport = StreamableTransport::new(None, None);
        let mut request = transport.open_request_stream(&[7.into()]).unwrap();
        transport.close().await.unwrap();
        assert!(request.recv().await.is_none());
        assert!(transport.send(reply(7)).await.is_err());
        assert!(transport.open_request_stream(&[8.into()]).is_err());
    }
}
