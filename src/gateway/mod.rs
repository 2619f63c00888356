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

//! HTTP session gateway.
//!
//! Terminates the legacy SSE family and the streamable HTTP family, owns the
//! session registry and drives one [`RpcEndpoint`] per session.
//!
//! Middleware stack (outermost to innermost):
//! - Preflight status (204) and CORS (tower-http::cors): preflights answered
//!   here, headers added to every response
//! - Error envelope: non-JSON 4xx/5xx bodies rewritten as JSON-RPC errors
//! - Tracing (tower-http::trace)
//! - Body size limit (tower-http::limit)
//! - Auth: health paths and preflights bypass it
//!
//! Every session is torn down exactly once, whichever of client disconnect,
//! DELETE, idle timeout, upstream failure or shutdown comes first: the
//! endpoint is closed, then `on_close` runs.

mod auth_middleware;
pub mod cors;
mod legacy;
pub mod registry;
pub mod session;
mod streamable;

use axum::body::to_bytes;
use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get, post};
use axum::{middleware, Router};
use futures::future::join_all;
use serde_json::json;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

pub use registry::SessionRegistry;
pub use session::{Downstream, LoggingHooks, Session, SessionHooks, SessionInfo, SessionKind};

use crate::auth::AuthGate;
use crate::config::GatewayConfig;
use crate::constants::{jsonrpc, limits, methods, routes};
use crate::error::{GatewayError, TransportError};
use crate::jsonrpc::{error_envelope, Notification};
use crate::rpc::{EndpointFactory, RpcEndpoint};
use crate::transport::tap::{TapSink, TappedTransport};
use crate::transport::Transport;
use cors::{cors_layer, preflight_status};

/// Shared by every handler of one gateway.
pub(crate) struct GatewayState {
    pub(crate) config: GatewayConfig,
    pub(crate) factory: Arc<dyn EndpointFactory>,
    pub(crate) hooks: Arc<dyn SessionHooks>,
    pub(crate) registry: SessionRegistry,
    pub(crate) auth: AuthGate,
    pub(crate) tap: Option<TapSink>,
    /// Cancelled when the listener stops; ends every open event stream.
    pub(crate) shutdown: CancellationToken,
}

impl GatewayState {
    /// Wrap a session transport in the tap, when one is configured.
    pub(crate) fn instrument(
        &self,
        label: String,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        match &self.tap {
            Some(sink) => Ok(Arc::new(TappedTransport::wrap(
                label,
                transport,
                sink.clone(),
            )?)),
            None => Ok(transport),
        }
    }

    /// Connect `endpoint` to `downstream`, register the session and run
    /// `on_connect`. The session is torn down when its endpoint closes.
    pub(crate) async fn open_session(
        self: &Arc<Self>,
        id: String,
        downstream: Downstream,
        endpoint: RpcEndpoint,
    ) -> Result<Arc<Session>, GatewayError> {
        let legacy = matches!(downstream, Downstream::Sse(_));
        let transport = self.instrument(format!("session:{}", id), downstream.as_transport())?;
        if let Err(e) = endpoint.connect(Arc::clone(&transport)).await {
            let _ = endpoint.close().await;
            return Err(e.into());
        }

        let session = Arc::new(Session::new(id, downstream, endpoint));
        if let Some(replaced) = self.registry.insert(Arc::clone(&session)).await {
            warn!(session_id = %replaced.id, "Session id collision, replacing stale entry");
        }
        if legacy {
            let established = Notification::new(
                methods::SSE_CONNECTION,
                Some(json!({ "message": methods::SSE_CONNECTION_MESSAGE })),
            );
            if let Err(e) = transport.send(established.into()).await {
                debug!(session_id = %session.id, error = %e, "Could not announce SSE connection");
            }
        }
        self.hooks
            .on_connect(&session.info(), session.endpoint())
            .await;

        let state = Arc::clone(self);
        let watched = Arc::clone(&session);
        let closed = session.endpoint().closed();
        tokio::spawn(async move {
            closed.cancelled().await;
            state.teardown(&watched).await;
        });

        Ok(session)
    }

    /// Close the session's endpoint, then run `on_close`. Only the first call
    /// for a given session does anything.
    pub(crate) async fn teardown(&self, session: &Arc<Session>) {
        if !session.begin_close() {
            return;
        }
        self.registry.remove_if_same(&session.id, session).await;
        if let Err(e) = session.endpoint().close().await {
            debug!(session_id = %session.id, error = %e, "Endpoint close reported an error");
        }
        self.hooks.on_close(&session.info(), session.endpoint()).await;
    }

    pub(crate) async fn close_all_sessions(&self) {
        let sessions = self.registry.snapshot().await;
        if sessions.is_empty() {
            return;
        }
        info!(count = sessions.len(), "Closing all sessions");
        join_all(sessions.iter().map(|session| self.teardown(session))).await;
    }

    /// Close streamable sessions idle for longer than `timeout`. SSE
    /// sessions live as long as their stream, and a streamable session whose
    /// standalone stream is still held open is not idle.
    async fn reap_idle(&self, timeout: Duration) {
        for session in self.registry.snapshot().await {
            let Some(transport) = session.streamable() else {
                continue;
            };
            if transport.has_standalone() {
                session.touch();
                continue;
            }
            if session.idle_for() >= timeout {
                info!(session_id = %session.id, "Closing idle session");
                self.teardown(&session).await;
            }
        }
    }
}

/// Run `future` on the current runtime, if there still is one. Used from
/// `Drop` impls, which may run while the runtime is going away.
pub(crate) fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(future);
    }
}

pub struct GatewayBuilder {
    config: GatewayConfig,
    factory: Arc<dyn EndpointFactory>,
    hooks: Arc<dyn SessionHooks>,
    tap: Option<TapSink>,
}

impl GatewayBuilder {
    pub fn hooks(mut self, hooks: Arc<dyn SessionHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Mirror every session transport onto `sink`.
    pub fn tap(mut self, sink: TapSink) -> Self {
        self.tap = Some(sink);
        self
    }

    pub fn build(self) -> Result<SessionGateway, GatewayError> {
        self.config.validate()?;
        let auth = AuthGate::new(self.config.auth.clone());
        Ok(SessionGateway {
            state: Arc::new(GatewayState {
                config: self.config,
                factory: self.factory,
                hooks: self.hooks,
                registry: SessionRegistry::new(),
                auth,
                tap: self.tap,
                shutdown: CancellationToken::new(),
            }),
        })
    }
}

/// One gateway instance. Instances share nothing; several can live in the
/// same process.
#[derive(Clone)]
pub struct SessionGateway {
    state: Arc<GatewayState>,
}

impl SessionGateway {
    pub fn builder(config: GatewayConfig, factory: Arc<dyn EndpointFactory>) -> GatewayBuilder {
        GatewayBuilder {
            config,
            factory,
            hooks: Arc::new(LoggingHooks),
            tap: None,
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.state.registry
    }

    pub async fn close_all_sessions(&self) {
        self.state.close_all_sessions().await;
    }

    /// The complete HTTP service, middleware included.
    pub fn router(&self) -> Router {
        let state = Arc::clone(&self.state);
        let config = &state.config;

        let mut router = Router::new();
        for path in &config.health_paths {
            router = router.route(path, get(health));
        }
        if let Some(sse_path) = &config.sse_path {
            router = router
                .route(sse_path, get(legacy::open_stream))
                .route(&config.message_path, post(legacy::post_message));
        }
        if let Some(path) = &config.streamable_path {
            router = router.route(path, any(streamable::handle));
        }

        router
            .fallback(not_found)
            .layer(middleware::from_fn_with_state(
                Arc::clone(&state),
                auth_middleware::auth_middleware,
            ))
            .layer(DefaultBodyLimit::disable())
            .layer(RequestBodyLimitLayer::new(limits::MAX_MESSAGE_SIZE_BYTES))
            .layer(TraceLayer::new_for_http())
            .layer(middleware::map_response(envelope_errors))
            .layer(cors_layer(&config.cors))
            .layer(middleware::from_fn(preflight_status))
            .with_state(state)
    }

    /// Bind `port` on every interface: `[::]` (dual-stack where the OS
    /// allows), else `0.0.0.0`.
    pub async fn bind_all(port: u16) -> io::Result<TcpListener> {
        match TcpListener::bind((Ipv6Addr::UNSPECIFIED, port)).await {
            Ok(listener) => Ok(listener),
            Err(e) => {
                debug!(error = %e, "IPv6 bind failed, falling back to IPv4");
                TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await
            }
        }
    }

    /// Serve on `listener` until [`GatewayHandle::shutdown`].
    pub async fn serve(self, listener: TcpListener) -> Result<GatewayHandle, GatewayError> {
        let local_addr = listener.local_addr()?;
        let state = Arc::clone(&self.state);
        let app = self.router();

        let stop = state.shutdown.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(stop.cancelled_owned())
                .await
        });

        if let Some(timeout) = state.config.session_timeout() {
            spawn_reaper(Arc::downgrade(&state), timeout);
        }

        info!(address = %local_addr, "Gateway listening");
        Ok(GatewayHandle {
            local_addr,
            state,
            server,
        })
    }
}

fn spawn_reaper(state: Weak<GatewayState>, timeout: Duration) {
    let period = (timeout / 2).clamp(Duration::from_millis(50), Duration::from_secs(30));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let Some(state) = state.upgrade() else {
                break;
            };
            if state.shutdown.is_cancelled() {
                break;
            }
            state.reap_idle(timeout).await;
        }
    });
}

/// A running gateway.
pub struct GatewayHandle {
    local_addr: SocketAddr,
    state: Arc<GatewayState>,
    server: JoinHandle<io::Result<()>>,
}

impl GatewayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.state.registry
    }

    /// Tear down every session (hooks included), stop accepting, and
    /// resolve once the server task is done.
    pub async fn shutdown(self) -> Result<(), GatewayError> {
        info!("Shutting down gateway");
        self.state.close_all_sessions().await;
        self.state.shutdown.cancel();

        let result = match self.server.await {
            Ok(result) => result.map_err(GatewayError::Io),
            Err(e) => Err(GatewayError::Io(io::Error::other(e))),
        };
        // Sessions opened while the first pass ran.
        self.state.close_all_sessions().await;
        result
    }
}

async fn health() -> &'static str {
    routes::HEALTH_BODY
}

/// Rewrite error responses produced outside the handlers (405 from the
/// method router, 413 from the body limit, extractor rejections) into the
/// JSON-RPC error envelope. Bodies that are already JSON pass through.
async fn envelope_errors(response: Response) -> Response {
    let status = response.status();
    if !(status.is_client_error() || status.is_server_error()) || is_json(response.headers()) {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let text = to_bytes(body, limits::MAX_REJECTION_BODY_BYTES)
        .await
        .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string())
        .unwrap_or_default();
    let message = if text.is_empty() {
        status.canonical_reason().unwrap_or("Error").to_string()
    } else {
        text
    };
    let code = if status.is_server_error() {
        jsonrpc::ERROR_INTERNAL
    } else {
        jsonrpc::ERROR_BAD_REQUEST
    };

    parts.headers.remove(header::CONTENT_LENGTH);
    parts.headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    (parts, Json(error_envelope(code, &message))).into_response()
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"))
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(error_envelope(jsonrpc::ERROR_INVALID_REQUEST, "Not Found")),
    )
        .into_response()
}
