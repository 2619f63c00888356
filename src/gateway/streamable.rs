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

//! Streamable HTTP family: one path, GET / POST / DELETE.
//!
//! | Mode      | POST                                   | GET               | DELETE   |
//! |-----------|----------------------------------------|-------------------|----------|
//! | stateful  | `initialize` without a session header  | standalone stream | teardown |
//! |           | creates the session; else needs header | (409 if open)     |          |
//! | stateless | fresh endpoint + transport per request | 405               | 405      |

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::session::{Downstream, Session};
use super::{spawn_detached, GatewayState};
use crate::constants::{headers, jsonrpc};
use crate::error::{GatewayError, SessionError};
use crate::event_log::EventLog;
use crate::jsonrpc::{error_envelope, parse_batch, Message, RequestId};
use crate::transport::sse::{SseFrame, SseStream};
use crate::transport::streamable::StreamableTransport;

pub(super) async fn handle(
    State(state): State<Arc<GatewayState>>,
    method: Method,
    request_headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result = match (method, state.config.stateless) {
        (Method::POST, false) => post(&state, &request_headers, &body).await,
        (Method::POST, true) => post_stateless(&state, &body).await,
        (Method::GET, false) => get(&state, &request_headers).await,
        (Method::DELETE, false) => delete(&state, &request_headers).await,
        _ => return method_not_allowed(),
    };
    result.unwrap_or_else(IntoResponse::into_response)
}

async fn post(
    state: &Arc<GatewayState>,
    request_headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, GatewayError> {
    let messages = parse_batch(body)?;
    let session = match session_header(request_headers) {
        Some(id) => lookup(state, id).await?,
        None if messages.iter().any(Message::is_initialize_request) => {
            create_session(state).await?
        }
        None => return Err(SessionError::Missing.into()),
    };
    let Some(transport) = session.streamable().cloned() else {
        return Err(SessionError::Unknown(session.id.clone()).into());
    };
    session.touch();

    let mut response = respond(state, &transport, messages, is_batch(body), Finish::none()).await?;
    attach_session_id(&mut response, &session.id);
    Ok(response)
}

async fn post_stateless(state: &Arc<GatewayState>, body: &[u8]) -> Result<Response, GatewayError> {
    let messages = parse_batch(body)?;

    let transport = Arc::new(StreamableTransport::new(None, None));
    let endpoint = state.factory.create().await?;
    let wired = state.instrument("stateless".to_string(), transport.clone())?;
    if let Err(e) = endpoint.connect(wired).await {
        let _ = endpoint.close().await;
        return Err(e.into());
    }

    // The endpoint lives exactly as long as this request's response.
    let finish = Finish::new(move || {
        spawn_detached(async move {
            let _ = endpoint.close().await;
        })
    });
    respond(state, &transport, messages, is_batch(body), finish).await
}

async fn get(state: &Arc<GatewayState>, request_headers: &HeaderMap) -> Result<Response, GatewayError> {
    let id = session_header(request_headers).ok_or(SessionError::Missing)?;
    let session = lookup(state, id).await?;
    let Some(transport) = session.streamable() else {
        return Err(SessionError::Unknown(session.id.clone()).into());
    };

    let last_event_id = request_headers
        .get(headers::LAST_EVENT_ID)
        .and_then(|value| value.to_str().ok());
    if last_event_id.is_some() && !transport.is_resumable() {
        debug!(session_id = %session.id, "Last-Event-ID ignored, session keeps no history");
    }
    let frames = transport.open_standalone(last_event_id)?;
    session.touch();

    let stream = SseStream::new(frames, state.shutdown.child_token());
    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response();
    attach_session_id(&mut response, &session.id);
    Ok(response)
}

async fn delete(state: &Arc<GatewayState>, request_headers: &HeaderMap) -> Result<Response, GatewayError> {
    let id = session_header(request_headers).ok_or(SessionError::Missing)?;
    let session = lookup(state, id).await?;
    debug!(session_id = %session.id, "Session terminated by client");
    state.teardown(&session).await;
    Ok(StatusCode::OK.into_response())
}

async fn create_session(state: &Arc<GatewayState>) -> Result<Arc<Session>, GatewayError> {
    let id = Uuid::new_v4().to_string();
    let transport = Arc::new(StreamableTransport::new(
        Some(id.clone()),
        Some(Arc::new(EventLog::new())),
    ));
    let endpoint = state.factory.create().await?;
    state
        .open_session(id, Downstream::Streamable(transport), endpoint)
        .await
}

async fn lookup(state: &GatewayState, id: &str) -> Result<Arc<Session>, SessionError> {
    state
        .registry
        .get(id)
        .await
        .ok_or_else(|| SessionError::Unknown(id.to_string()))
}

/// Deliver one POST body and build its response: 202 when nothing needs an
/// answer, otherwise an event stream (or JSON body) carrying the responses.
async fn respond(
    state: &GatewayState,
    transport: &StreamableTransport,
    messages: Vec<Message>,
    batch: bool,
    finish: Finish,
) -> Result<Response, GatewayError> {
    let ids: Vec<RequestId> = messages
        .iter()
        .filter(|message| message.is_request())
        .filter_map(|message| message.id().cloned())
        .collect();

    if ids.is_empty() {
        deliver_all(transport, messages)?;
        return Ok((StatusCode::ACCEPTED, "Accepted").into_response());
    }

    let frames = transport.open_request_stream(&ids)?;
    deliver_all(transport, messages)?;

    if state.config.json_response {
        let replies = collect_replies(frames, state.shutdown.child_token()).await;
        drop(finish);
        return json_reply(replies, batch);
    }

    let stream =
        SseStream::new(frames, state.shutdown.child_token()).on_drop(move || drop(finish));
    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

fn deliver_all(transport: &StreamableTransport, messages: Vec<Message>) -> Result<(), SessionError> {
    for message in messages {
        transport.deliver(message).map_err(|_| SessionError::Closed)?;
    }
    Ok(())
}

async fn collect_replies(
    mut frames: mpsc::UnboundedReceiver<SseFrame>,
    cancel: CancellationToken,
) -> Vec<Message> {
    let mut replies = Vec::new();
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.recv() => frame,
        };
        match frame {
            Some(SseFrame::Message { message, .. }) => replies.push(message),
            Some(SseFrame::Endpoint(_)) => {}
            None => break,
        }
    }
    replies
}

fn json_reply(mut replies: Vec<Message>, batch: bool) -> Result<Response, GatewayError> {
    if replies.is_empty() {
        warn!("Session closed before any response was produced");
        return Err(SessionError::Closed.into());
    }
    let body = if !batch && replies.len() == 1 {
        serde_json::to_value(replies.remove(0))
    } else {
        serde_json::to_value(replies)
    };
    let body: Value = body.map_err(crate::error::TransportError::from)?;
    Ok(Json(body).into_response())
}

fn session_header(request_headers: &HeaderMap) -> Option<&str> {
    request_headers
        .get(headers::SESSION_ID)
        .and_then(|value| value.to_str().ok())
        .filter(|id| !id.is_empty())
}

fn attach_session_id(response: &mut Response, id: &str) {
    if let Ok(value) = HeaderValue::from_str(id) {
        response.headers_mut().insert(headers::SESSION_ID, value);
    }
}

fn is_batch(body: &[u8]) -> bool {
    body.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'[')
}

fn method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(error_envelope(jsonrpc::ERROR_BAD_REQUEST, "Method not allowed.")),
    )
        .into_response()
}

/// Runs its callback once, when dropped.
struct Finish(Option<Box<dyn FnOnce() + Send>>);

impl Finish {
    fn new(callback: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(callback)))
    }

    fn none() -> Self {
        Self(None)
    }
}

impl Drop for Finish {
    fn drop(&mut self) {
        if let Some(callback) = self.0.take() {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_batch() {
        assert!(is_batch(b"  [{}]"));
        assert!(!is_batch(b"{\"a\": [1]}"));
        assert!(!is_batch(b""));
    }

    #[test]
    fn test_finish_runs_once_on_drop() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let finish = Finish::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(finish);
        drop(Finish::none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
