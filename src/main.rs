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

// Main entry point for lilith-gateway

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use lilith_gateway::auth::{AuthConfig, OAuthChallenge};
use lilith_gateway::config::{Config, CorsConfig, GatewayConfig};
use lilith_gateway::constants::routes;
use lilith_gateway::rpc::{EndpointFactory, ProcessPerEndpoint, SharedUpstream};
use lilith_gateway::transport::process::{ProcessCommand, ProcessTransport};
use lilith_gateway::transport::tap::{log_tap_events, TappedTransport};
use lilith_gateway::transport::Transport;
use lilith_gateway::SessionGateway;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Command line of the stdio server, run through the shell
    #[arg(long)]
    stdio: String,

    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Prefix for the message URL announced to SSE clients
    #[arg(long, default_value = "")]
    base_url: String,

    #[arg(long, default_value = routes::SSE)]
    sse_path: String,

    #[arg(long, default_value = routes::MESSAGE)]
    message_path: String,

    #[arg(long, default_value = routes::STREAMABLE_HTTP)]
    streamable_http_path: String,

    #[arg(long)]
    disable_sse: bool,

    #[arg(long)]
    disable_streamable_http: bool,

    /// Fresh endpoint per streamable HTTP request, no sessions
    #[arg(long)]
    stateless: bool,

    /// Answer streamable HTTP POSTs with JSON instead of an event stream
    #[arg(long)]
    json_response: bool,

    /// Liveness path, repeatable (default /healthz)
    #[arg(long = "health-endpoint")]
    health_endpoints: Vec<String>,

    /// Allowed CORS origin, repeatable (default: any)
    #[arg(long = "cors-origin")]
    cors_origins: Vec<String>,

    /// Required x-api-key value (falls back to LILITH_GATEWAY_API_KEY)
    #[arg(long)]
    api_key: Option<String>,

    #[arg(long)]
    oauth_realm: Option<String>,

    /// Protected resource URL for the WWW-Authenticate challenge
    #[arg(long)]
    oauth_resource: Option<String>,

    #[arg(long)]
    oauth_scope: Option<String>,

    /// Close streamable sessions idle for this long
    #[arg(long)]
    session_timeout_ms: Option<u64>,

    /// Spawn one stdio server per session instead of sharing one
    #[arg(long)]
    process_per_session: bool,

    /// Log every message crossing a transport
    #[arg(long)]
    trace_transport: bool,

    #[arg(long)]
    log_level: Option<String>,

    #[arg(long, value_parser = ["text", "json"])]
    log_format: Option<String>,
}

impl Cli {
    fn gateway_config(&self, api_key: Option<String>) -> GatewayConfig {
        let oauth = if self.oauth_realm.is_some()
            || self.oauth_resource.is_some()
            || self.oauth_scope.is_some()
        {
            Some(OAuthChallenge {
                realm: self.oauth_realm.clone(),
                resource_url: self.oauth_resource.clone(),
                scope: self.oauth_scope.clone(),
                ..Default::default()
            })
        } else {
            None
        };

        let defaults = GatewayConfig::default();
        GatewayConfig {
            base_url: self.base_url.clone(),
            sse_path: (!self.disable_sse).then(|| self.sse_path.clone()),
            message_path: self.message_path.clone(),
            streamable_path: (!self.disable_streamable_http)
                .then(|| self.streamable_http_path.clone()),
            stateless: self.stateless,
            json_response: self.json_response,
            health_paths: if self.health_endpoints.is_empty() {
                defaults.health_paths
            } else {
                self.health_endpoints.clone()
            },
            cors: CorsConfig {
                allowed_origins: self.cors_origins.clone(),
            },
            auth: AuthConfig { api_key, oauth },
            session_timeout_ms: self.session_timeout_ms,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        config.log_format = format.clone();
    }
    if cli.api_key.is_some() {
        config.api_key = cli.api_key.clone();
    }
    init_tracing(&config);

    let gateway_config = cli.gateway_config(config.api_key.clone());
    info!(
        stdio = %cli.stdio,
        sse = ?gateway_config.sse_path,
        streamable = ?gateway_config.streamable_path,
        stateless = gateway_config.stateless,
        auth = gateway_config.auth.api_key.is_some(),
        "Starting lilith-gateway"
    );

    let tap = if cli.trace_transport {
        let (sink, events) = mpsc::unbounded_channel();
        tokio::spawn(log_tap_events(events));
        Some(sink)
    } else {
        None
    };

    let command = ProcessCommand::shell(cli.stdio.clone());
    let mut shared = None;
    let factory: Arc<dyn EndpointFactory> = if cli.process_per_session {
        let mut factory = ProcessPerEndpoint::new(command);
        if let Some(sink) = &tap {
            factory = factory.with_tap(sink.clone());
        }
        Arc::new(factory)
    } else {
        let process: Arc<dyn Transport> = Arc::new(ProcessTransport::new(command));
        let transport: Arc<dyn Transport> = match &tap {
            Some(sink) => Arc::new(TappedTransport::wrap("upstream", process, sink.clone())?),
            None => process,
        };
        let upstream = Arc::new(
            SharedUpstream::connect(transport)
                .await
                .context("failed to start the stdio server")?,
        );
        shared = Some(Arc::clone(&upstream));
        upstream
    };
    let upstream_closed = shared
        .as_ref()
        .map(|upstream| upstream.client().closed())
        .unwrap_or_else(CancellationToken::new);

    let mut builder = SessionGateway::builder(gateway_config, factory);
    if let Some(sink) = tap {
        builder = builder.tap(sink);
    }
    let gateway = builder.build()?;

    let listener = SessionGateway::bind_all(cli.port)
        .await
        .with_context(|| format!("failed to bind port {}", cli.port))?;
    let handle = gateway.serve(listener).await?;

    let upstream_failed = wait_for_exit(upstream_closed).await;
    handle.shutdown().await?;
    if let Some(upstream) = shared {
        let _ = upstream.client().close().await;
    }

    if upstream_failed {
        anyhow::bail!("stdio server exited");
    }
    info!("Shutdown complete");
    Ok(())
}

/// True when the upstream went away first.
async fn wait_for_exit(upstream_closed: CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown_signal() => false,
        _ = upstream_closed.cancelled() => {
            error!("stdio server exited, shutting down");
            true
        }
    }
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    // RUST_LOG wins over LOG_LEVEL
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_env_filter(filter);

    if config.log_format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Ctrl+C received, starting graceful shutdown");
        },
        _ = terminate => {
            info!("SIGTERM received, starting graceful shutdown");
        },
    }
}
