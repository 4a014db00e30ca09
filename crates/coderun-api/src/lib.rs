//! HTTP and WebSocket front end for the coderun execution service.
//!
//! Two transports share one [`SessionOrchestrator`]: `POST /v1/execute`
//! runs a snippet and answers with the collected output, while
//! `GET /v1/execute` upgrades to a WebSocket and relays output as it is
//! produced. `GET /v1/healthcheck` reports liveness.

pub mod error;
pub mod execute;
pub mod stream;

pub use error::{Result, ServerError};
pub use stream::run_stream_session;

use axum::extract::{ConnectInfo, DefaultBodyLimit, Request, State};
use axum::middleware::{self, Next};
use axum::response::{Json, Response};
use axum::routing::{get, post};
use axum::Router;
use coderun_core::config::{Environment, ServerSettings};
use coderun_core::SessionOrchestrator;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub environment: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Reported by the health endpoint
    pub environment: Environment,
    /// Accept requests from any origin
    pub enable_cors: bool,
    /// Maximum request body size in bytes
    pub max_body_size: usize,
    /// Enable request logging
    pub enable_logging: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 4000),
            environment: Environment::Development,
            enable_cors: true,
            max_body_size: 1024 * 1024,
            enable_logging: true,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the `server` section of the configuration file.
    pub fn from_settings(settings: &ServerSettings) -> Result<Self> {
        Self::new()
            .with_bind_addr_str(&format!("{}:{}", settings.host, settings.port))
            .map(|config| {
                config
                    .with_environment(settings.environment)
                    .with_cors(settings.enable_cors)
                    .with_max_body_size(settings.max_body_size)
                    .with_logging(settings.enable_logging)
            })
    }

    /// Parse and set the bind address from a string.
    pub fn with_bind_addr_str(mut self, addr: &str) -> Result<Self> {
        self.bind_addr = addr
            .parse()
            .map_err(|e| ServerError::config_error(format!("Invalid bind address '{}': {}", addr, e)))?;
        Ok(self)
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_cors(mut self, enable: bool) -> Self {
        self.enable_cors = enable;
        self
    }

    pub fn with_max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    pub fn with_logging(mut self, enable: bool) -> Self {
        self.enable_logging = enable;
        self
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SessionOrchestrator>,
    pub config: ServerConfig,
}

async fn healthcheck_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "available".to_string(),
        environment: state.config.environment.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now(),
    })
}

/// One log line per request; failures (status >= 400) are logged as errors.
async fn log_request(request: Request, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4();
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "-".to_string());
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let start = Instant::now();
    let response = next.run(request).await;
    let duration = start.elapsed();

    let status = response.status();
    if status.is_client_error() || status.is_server_error() {
        log::error!(
            "{} {} {} {} {} {:?}",
            request_id,
            remote,
            method,
            path,
            status.as_u16(),
            duration
        );
    } else {
        log::info!(
            "{} {} {} {} {} {:?}",
            request_id,
            remote,
            method,
            path,
            status.as_u16(),
            duration
        );
    }
    response
}

/// The execution service's HTTP server.
pub struct CoderunServer {
    orchestrator: Arc<SessionOrchestrator>,
    config: ServerConfig,
}

impl CoderunServer {
    pub fn new(orchestrator: Arc<SessionOrchestrator>) -> Self {
        Self {
            orchestrator,
            config: ServerConfig::default(),
        }
    }

    pub fn with_config(orchestrator: Arc<SessionOrchestrator>, config: ServerConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// Build the Axum router with all routes and middleware.
    pub fn build_router(&self) -> Router {
        let state = AppState {
            orchestrator: self.orchestrator.clone(),
            config: self.config.clone(),
        };

        let mut router = Router::new()
            .route("/v1/healthcheck", get(healthcheck_handler))
            .route(
                "/v1/execute",
                post(execute::execute_handler).get(stream::stream_handler),
            )
            .layer(DefaultBodyLimit::max(self.config.max_body_size))
            .with_state(state);

        if self.config.enable_logging {
            router = router.layer(middleware::from_fn(log_request));
        }

        router = router.layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            router = router.layer(CorsLayer::permissive());
        }

        router
    }

    /// Start the server with graceful shutdown support.
    ///
    /// Returns once `shutdown_signal` resolves and in-flight requests finish.
    pub async fn serve_with_shutdown<F>(self, shutdown_signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| {
                ServerError::config_error(format!(
                    "Failed to bind to {}: {}",
                    self.config.bind_addr, e
                ))
            })?;

        log::info!(
            "coderun server starting on {} ({} environment)",
            self.config.bind_addr,
            self.config.environment
        );
        log::info!("Health check: http://{}/v1/healthcheck", self.config.bind_addr);
        log::info!("Execute endpoint: http://{}/v1/execute", self.config.bind_addr);

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal)
        .await
        .map_err(|e| ServerError::internal(format!("Server error: {}", e)))?;

        log::info!("coderun server shut down gracefully");
        Ok(())
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            log::info!("Received SIGTERM, shutting down...");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use coderun_core::runtime::{ScriptedExit, ScriptedRuntime};
    use coderun_core::CoderunConfig;
    use tower::ServiceExt; // for `oneshot`

    fn router(runtime: &ScriptedRuntime, deadline_secs: u64) -> Router {
        let mut config = CoderunConfig::default();
        config.execution.deadline_secs = deadline_secs;
        let orchestrator = SessionOrchestrator::new(Arc::new(runtime.clone()), &config);
        CoderunServer::new(Arc::new(orchestrator)).build_router()
    }

    fn execute_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/execute")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[test]
    fn test_config_from_settings() {
        let mut settings = ServerSettings::default();
        settings.host = "127.0.0.1".to_string();
        settings.port = 8081;
        settings.environment = Environment::Production;
        settings.enable_cors = false;

        let config = ServerConfig::from_settings(&settings).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8081".parse::<SocketAddr>().unwrap());
        assert_eq!(config.environment, Environment::Production);
        assert!(!config.enable_cors);

        settings.host = "not a host".to_string();
        assert!(ServerConfig::from_settings(&settings).is_err());
    }

    #[tokio::test]
    async fn test_healthcheck() {
        let app = router(&ScriptedRuntime::new(), 10);
        let request = Request::builder()
            .uri("/v1/healthcheck")
            .body(Body::empty())
            .unwrap();

        let (status, body) = send(app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "available");
        assert_eq!(body["environment"], "development");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_execute_success() {
        let runtime = ScriptedRuntime::new().with_stdout("1\n");
        let (status, body) = send(router(&runtime, 10), execute_request(r#"{"text":"print(1)"}"#)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["output"], "1\n");
        assert_eq!(runtime.remove_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_execute_program_error_is_still_ok() {
        let runtime = ScriptedRuntime::new()
            .with_stderr("undefined: x\n")
            .with_exit(ScriptedExit::Code(1));
        let (status, body) = send(router(&runtime, 10), execute_request(r#"{"text":"x"}"#)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "error");
        assert_eq!(body["output"], "undefined: x\n");
        assert_eq!(body["exit_code"], 1);
    }

    #[tokio::test]
    async fn test_execute_create_failure() {
        let runtime = ScriptedRuntime::new().failing_create("no such image");
        let (status, body) = send(router(&runtime, 10), execute_request(r#"{"text":"x"}"#)).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["status"], "error");
        assert!(body["error"]
            .as_str()
            .unwrap()
            .contains("Failed to create container"));
        assert!(runtime.remove_calls().is_empty());
    }

    #[tokio::test]
    async fn test_execute_malformed_payload() {
        let runtime = ScriptedRuntime::new();
        let (status, body) = send(router(&runtime, 10), execute_request("{\"code\": 1")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let runtime = ScriptedRuntime::new()
            .with_stdout("tick\n")
            .with_exit(ScriptedExit::Hang);
        let (status, body) = send(router(&runtime, 1), execute_request(r#"{"text":"for {}"}"#)).await;

        assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
        assert_eq!(body["status"], "timeout");
        assert_eq!(body["output"], "tick\n");
        assert_eq!(runtime.remove_calls().len(), 1);
    }
}
