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

//! API key gate and OAuth bearer challenge.
//!
//! `AuthGate` is a pure function of the request headers and a static
//! configuration. It never touches sessions or routing; the HTTP layer calls
//! [`AuthGate::validate`] and, on failure, answers with
//! [`AuthGate::challenge_response`].

use axum::http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, WWW_AUTHENTICATE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use subtle::ConstantTimeEq;

use crate::constants::{headers, jsonrpc, oauth};
use crate::jsonrpc::error_envelope;

/// OAuth protected-resource challenge parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OAuthChallenge {
    pub realm: Option<String>,
    /// Protected resource URL; `resource_metadata` is derived from it verbatim.
    pub resource_url: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
    pub error_uri: Option<String>,
    pub scope: Option<String>,
}

/// Per-call overrides. Each field present here wins over the static config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChallengeOverrides {
    pub error: Option<String>,
    pub error_description: Option<String>,
    pub error_uri: Option<String>,
    pub scope: Option<String>,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    pub api_key: Option<String>,
    pub oauth: Option<OAuthChallenge>,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<REDACTED>"))
            .field("oauth", &self.oauth)
            .finish()
    }
}

/// A ready-to-send 401.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub body: Value,
    pub headers: Vec<(HeaderName, HeaderValue)>,
}

impl IntoResponse for Challenge {
    fn into_response(self) -> Response {
        let mut response = (StatusCode::UNAUTHORIZED, self.body.to_string()).into_response();
        let map = response.headers_mut();
        for (name, value) in self.headers {
            map.insert(name, value);
        }
        response
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuthGate {
    config: AuthConfig,
}

impl AuthGate {
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// True when no key is configured. Otherwise exactly one `x-api-key`
    /// value must be present and equal the configured key byte for byte.
    pub fn validate(&self, request_headers: &HeaderMap) -> bool {
        let Some(expected) = self.config.api_key.as_deref() else {
            return true;
        };

        let mut values = request_headers.get_all(headers::API_KEY).iter();
        let (Some(value), None) = (values.next(), values.next()) else {
            // absent, or supplied more than once
            return false;
        };
        let Ok(presented) = value.to_str() else {
            return false;
        };
        presented.as_bytes().ct_eq(expected.as_bytes()).into()
    }

    pub fn challenge_response(&self, overrides: Option<&ChallengeOverrides>) -> Challenge {
        let overrides = overrides.cloned().unwrap_or_default();
        let configured = self.config.oauth.as_ref();

        let description = overrides
            .error_description
            .clone()
            .or_else(|| configured.and_then(|o| o.error_description.clone()))
            .unwrap_or_else(|| oauth::DEFAULT_ERROR_DESCRIPTION.to_string());

        let mut challenge_headers = vec![(CONTENT_TYPE, HeaderValue::from_static("application/json"))];

        if let Some(oauth_config) = configured {
            let header = bearer_header(oauth_config, &overrides, &description);
            match HeaderValue::from_str(&header) {
                Ok(value) => challenge_headers.push((WWW_AUTHENTICATE, value)),
                Err(e) => tracing::warn!(error = %e, "Dropping unrepresentable WWW-Authenticate header"),
            }
        }

        Challenge {
            body: error_envelope(jsonrpc::ERROR_UNAUTHORIZED, &description),
            headers: challenge_headers,
        }
    }
}

fn bearer_header(config: &OAuthChallenge, overrides: &ChallengeOverrides, description: &str) -> String {
    let error = overrides
        .error
        .clone()
        .or_else(|| config.error.clone())
        .unwrap_or_else(|| oauth::DEFAULT_ERROR.to_string());
    let error_uri = overrides.error_uri.clone().or_else(|| config.error_uri.clone());
    let scope = overrides.scope.clone().or_else(|| config.scope.clone());

    let mut params: Vec<String> = Vec::new();
    if let Some(realm) = &config.realm {
        params.push(format!("realm=\"{}\"", realm));
    }
    if let Some(resource) = &config.resource_url {
        params.push(format!(
            "resource_metadata=\"{}{}\"",
            resource,
            oauth::RESOURCE_METADATA_SUFFIX
        ));
    }
    params.push(format!("error=\"{}\"", error));
    params.push(format!(
        "error_description=\"{}\"",
        description.replace('"', "\\\"")
    ));
    if let Some(uri) = error_uri {
        params.push(format!("error_uri=\"{}\"", uri));
    }
    if let Some(scope) = scope {
        params.push(format!("scope=\"{}\"", scope));
    }

    format!("Bearer {}", params.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(key: Option<&str>) -> AuthGate {
        AuthGate::new(AuthConfig {
            api_key: key.map(str::to_string),
            oauth: None,
        })
    }

    #[test]
    fn test_no_key_allows_everything() {
        assert!(gate(None).validate(&HeaderMap::new()));
    }

    #[test]
    fn test_key_must_match_exactly() {
        let g = gate(Some("Secret"));
        let mut headers = HeaderMap::new();
        assert!(!g.validate(&headers));

        headers.insert("X-API-Key", "Secret".parse().unwrap());
        assert!(g.validate(&headers));

        headers.insert("x-api-key", "secret".parse().unwrap());
        assert!(!g.validate(&headers));
    }

    #[test]
    fn test_duplicate_header_is_rejected() {
        let g = gate(Some("k"));
        let mut headers = HeaderMap::new();
        headers.append("x-api-key", "k".parse().unwrap());
        headers.append("x-api-key", "k".parse().unwrap());
        assert!(!g.validate(&headers));
    }

    #[test]
    fn test_plain_challenge() {
        let challenge = gate(Some("k")).challenge_response(None);
        assert_eq!(challenge.body["error"]["code"], 401);
        assert_eq!(challenge.body["error"]["message"], "Authentication required");
        assert!(challenge.body["id"].is_null());
        assert!(challenge.headers.iter().all(|(name, _)| name != WWW_AUTHENTICATE));
    }

    #[test]
    fn test_bearer_parameter_order() {
        let g = AuthGate::new(AuthConfig {
            api_key: Some("k".into()),
            oauth: Some(OAuthChallenge {
                realm: Some("mcp".into()),
                resource_url: Some("https://api.example/".into()),
                error_uri: Some("https://docs.example/auth".into()),
                scope: Some("read".into()),
                ..Default::default()
            }),
        });
        let challenge = g.challenge_response(None);
        let header = challenge
            .headers
            .iter()
            .find(|(name, _)| name == WWW_AUTHENTICATE)
            .map(|(_, v)| v.to_str().unwrap().to_string())
            .unwrap();
        assert_eq!(
            header,
            "Bearer realm=\"mcp\", \
             resource_metadata=\"https://api.example//.well-known/oauth-protected-resource\", \
             error=\"invalid_token\", error_description=\"Authentication required\", \
             error_uri=\"https://docs.example/auth\", scope=\"read\""
        );
    }

    #[test]
    fn test_overrides_take_precedence() {
        let g = AuthGate::new(AuthConfig {
            api_key: None,
            oauth: Some(OAuthChallenge {
                error: Some("invalid_request".into()),
                error_description: Some("static".into()),
                ..Default::default()
            }),
        });
        let challenge = g.challenge_response(Some(&ChallengeOverrides {
            error: Some("insufficient_scope".into()),
            error_description: Some("needs \"write\"".into()),
            ..Default::default()
        }));
        let header = challenge
            .headers
            .iter()
            .find(|(name, _)| name == WWW_AUTHENTICATE)
            .map(|(_, v)| v.to_str().unwrap().to_string())
            .unwrap();
        assert_eq!(
            header,
            "Bearer error=\"insufficient_scope\", error_description=\"needs \\\"write\\\"\""
        );
        assert_eq!(challenge.body["error"]["message"], "needs \"write\"");
    }
}
