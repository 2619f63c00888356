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

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::time::Duration;

use crate::auth::AuthConfig;
use crate::constants::{config as env_keys, routes};
use crate::error::GatewayError;

/// Process-level settings read from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub log_level: String,
    pub log_format: String, // "json" or "text"
    pub api_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            log_level: env::var(env_keys::ENV_LOG_LEVEL).unwrap_or_else(|_| "info".to_string()),
            log_format: env::var(env_keys::ENV_LOG_FORMAT).unwrap_or_else(|_| "text".to_string()),
            api_key: env::var(env_keys::ENV_API_KEY)
                .ok()
                .filter(|key| !key.is_empty()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            api_key: None,
        }
    }
}

/// Which origins get CORS headers. Empty means any origin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Prefix for the URL announced in the SSE `endpoint` event.
    pub base_url: String,
    /// Legacy SSE stream path; `None` disables the legacy family.
    pub sse_path: Option<String>,
    pub message_path: String,
    /// Streamable HTTP path; `None` disables the family.
    pub streamable_path: Option<String>,
    pub stateless: bool,
    /// Answer streamable POSTs with a JSON body instead of an event stream.
    pub json_response: bool,
    pub health_paths: Vec<String>,
    pub cors: CorsConfig,
    pub auth: AuthConfig,
    /// Idle streamable sessions are closed after this long.
    pub session_timeout_ms: Option<u64>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            sse_path: Some(routes::SSE.to_string()),
            message_path: routes::MESSAGE.to_string(),
            streamable_path: Some(routes::STREAMABLE_HTTP.to_string()),
            stateless: false,
            json_response: false,
            health_paths: vec![routes::HEALTH.to_string()],
            cors: CorsConfig::default(),
            auth: AuthConfig::default(),
            session_timeout_ms: None,
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.sse_path.is_none() && self.streamable_path.is_none() {
            return Err(GatewayError::Config(
                "at least one of the SSE and streamable HTTP transports must be enabled".into(),
            ));
        }

        let mut seen = HashSet::new();
        for path in self.routed_paths() {
            if !path.starts_with('/') {
                return Err(GatewayError::Config(format!(
                    "path '{}' must start with '/'",
                    path
                )));
            }
            if !seen.insert(path) {
                return Err(GatewayError::Config(format!(
                    "path '{}' is used for more than one route",
                    path
                )));
            }
        }

        if self.session_timeout_ms == Some(0) {
            return Err(GatewayError::Config(
                "session timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    fn routed_paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.health_paths.iter().map(String::as_str).collect();
        if let Some(sse) = &self.sse_path {
            paths.push(sse);
            paths.push(&self.message_path);
        }
        if let Some(streamable) = &self.streamable_path {
            paths.push(streamable);
        }
        paths
    }

    pub fn is_health_path(&self, path: &str) -> bool {
        self.health_paths.iter().any(|p| p == path)
    }

    pub fn session_timeout(&self) -> Option<Duration> {
        self.session_timeout_ms.map(Duration::from_millis)
    }

    /// URL a legacy SSE client must POST to.
    pub fn message_endpoint(&self, session_id: &str) -> String {
        format!(
            "{}{}?{}={}",
            self.base_url.trim_end_matches('/'),
            self.message_path,
            routes::SESSION_QUERY_PARAM,
            session_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.is_health_path("/healthz"));
        assert_eq!(config.message_endpoint("abc"), "/message?sessionId=abc");
    }

    #[test]
    fn test_base_url_prefix() {
        let config = GatewayConfig {
            base_url: "http://localhost:8000/".into(),
            ..Default::default()
        };
        assert_eq!(
            config.message_endpoint("x"),
            "http://localhost:8000/message?sessionId=x"
        );
    }

    #[test]
    fn test_rejects_bad_configs() {
        let both_off = GatewayConfig {
            sse_path: None,
            streamable_path: None,
            ..Default::default()
        };
        assert!(both_off.validate().is_err());

        let clash = GatewayConfig {
            streamable_path: Some("/sse".into()),
            ..Default::default()
        };
        assert!(clash.validate().is_err());

        let relative = GatewayConfig {
            message_path: "message".into(),
            ..Default::default()
        };
        assert!(relative.validate().is_err());
    }

    #[test]
    fn test_message_path_ignored_when_sse_disabled() {
        let config = GatewayConfig {
            sse_path: None,
            message_path: "/mcp".into(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
