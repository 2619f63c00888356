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

// Axum authentication middleware

use axum::extract::{Request, State};
use axum::http::Method;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::warn;

use super::GatewayState;

/// Rejects requests that fail [`AuthGate::validate`](crate::auth::AuthGate::validate)
/// with the gate's challenge. Health probes and preflights pass untouched.
pub async fn auth_middleware(
    State(state): State<Arc<GatewayState>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if request.method() == Method::OPTIONS || state.config.is_health_path(path) {
        return next.run(request).await;
    }

    if !state.auth.validate(request.headers()) {
        warn!(
            method = %request.method(),
            path = %path,
            "Rejected request without a valid API key"
        );
        return state.auth.challenge_response(None).into_response();
    }

    next.run(request).await
}
