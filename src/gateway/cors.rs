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

//! CORS.
//!
//! `CorsLayer` sits outermost, so it also decorates 401s, 404s and error
//! envelopes. Preflights (`OPTIONS`) are answered by the layer itself and
//! never reach auth or routing; [`preflight_status`] turns their 200 into the
//! 204 clients expect. The allowed origin is always the request's own
//! `Origin`, never a wildcard, because credentials are allowed.

use axum::extract::Request;
use axum::http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, ORIGIN};
use axum::http::request::Parts;
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;
use tower_http::cors::{AllowCredentials, AllowOrigin, CorsLayer};

use crate::config::CorsConfig;
use crate::constants::headers;

/// `CorsLayer` for `config`. An empty allow list (or `*`) admits any origin.
pub fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let allowed: Arc<[String]> = config.allowed_origins.clone().into();
    let origin_allowed = move |origin: &HeaderValue, _: &Parts| allows(&allowed, origin);

    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(origin_allowed.clone()))
        .allow_credentials(AllowCredentials::predicate(origin_allowed))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            CONTENT_TYPE,
            ACCEPT,
            AUTHORIZATION,
            HeaderName::from_static(headers::API_KEY),
            HeaderName::from_static(headers::SESSION_ID),
            HeaderName::from_static(headers::LAST_EVENT_ID),
            HeaderName::from_static(headers::PROTOCOL_VERSION),
        ])
        .expose_headers([HeaderName::from_static(headers::SESSION_ID)])
        .vary([ORIGIN])
}

fn allows(allowed: &[String], origin: &HeaderValue) -> bool {
    let Ok(origin) = origin.to_str() else {
        return false;
    };
    allowed.is_empty() || allowed.iter().any(|a| a == "*" || a == origin)
}

/// Outside [`cors_layer`]: preflight answers carry no body, so say so.
pub async fn preflight_status(request: Request, next: Next) -> Response {
    let preflight = request.method() == Method::OPTIONS;
    let mut response = next.run(request).await;
    if preflight && response.status() == StatusCode::OK {
        *response.status_mut() = StatusCode::NO_CONTENT;
    }
    response
}
