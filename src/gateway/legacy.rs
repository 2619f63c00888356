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

// Legacy SSE family: GET opens the stream, POST ?sessionId= feeds it.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::session::Downstream;
use super::{spawn_detached, GatewayState};
use crate::constants::routes;
use crate::error::{GatewayError, SessionError, TransportError};
use crate::jsonrpc::Message;
use crate::transport::sse::{SseStream, SseTransport};

pub(super) async fn open_stream(
    State(state): State<Arc<GatewayState>>,
) -> Result<Response, GatewayError> {
    let session_id = Uuid::new_v4().to_string();
    let transport = Arc::new(SseTransport::new(
        session_id.clone(),
        state.config.message_endpoint(&session_id),
    ));
    let frames = transport.take_frames().ok_or(TransportError::InboundTaken)?;

    let endpoint = state.factory.create().await?;
    let session = state
        .open_session(session_id, Downstream::Sse(transport), endpoint)
        .await?;

    let stream = SseStream::new(frames, state.shutdown.child_token()).on_drop({
        let state = Arc::clone(&state);
        move || {
            debug!(session_id = %session.id, "SSE client disconnected");
            spawn_detached(async move { state.teardown(&session).await });
        }
    });
    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

pub(super) async fn post_message(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let session_id = query
        .get(routes::SESSION_QUERY_PARAM)
        .filter(|id| !id.is_empty())
        .ok_or(SessionError::Missing)?;
    let session = state
        .registry
        .get(session_id)
        .await
        .ok_or_else(|| SessionError::Unknown(session_id.clone()))?;
    let transport = session
        .sse()
        .ok_or_else(|| SessionError::Unknown(session_id.clone()))?;

    let message = Message::parse_slice(&body)?;
    session.touch();
    transport
        .deliver(message)
        .map_err(|_| SessionError::Closed)?;

    Ok((StatusCode::ACCEPTED, "Accepted").into_response())
}
