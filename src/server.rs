//! Gateway HTTP Server
//!
//! Axum router exposing the gateway: one SSE endpoint for questions plus
//! health, node, stats and budget endpoints. Graceful shutdown on Ctrl+C
//! or SIGTERM.

use crate::gateway::{Gateway, Question};
use axum::{
    extract::State,
    http::{header, Method},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use futures_util::stream::{Stream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

type BoxedSseStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(gateway: Gateway) -> Self {
        Self {
            gateway,
            start_time: Instant::now(),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
    nodes: usize,
    healthy_nodes: usize,
    timestamp: String,
}

/// Build the router with all routes and middleware
pub fn router(gateway: Gateway) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health))
        .route("/v1/ask", post(ask))
        .route("/v1/nodes", get(nodes))
        .route("/v1/stats", get(stats))
        .route("/v1/budget/reset", post(reset_budget))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(AppState::new(gateway))
}

/// Serve until a shutdown signal arrives
pub async fn run(gateway: Gateway, addr: SocketAddr) -> anyhow::Result<()> {
    let router = router(gateway);

    if !addr.ip().is_loopback() {
        warn!("Gateway bound to {} - no authentication in front of it", addr);
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Gateway shut down gracefully");
    Ok(())
}

/// POST /v1/ask - answer as a server-sent event stream
async fn ask(State(state): State<AppState>, Json(question): Json<Question>) -> Response {
    let events = state.gateway.ask(question).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok::<_, Infallible>(Event::default().event(event.name()).data(data))
    });

    let boxed: BoxedSseStream = Box::pin(events);
    Sse::new(boxed)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keepalive"),
        )
        .into_response()
}

/// GET /health
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let nodes = state.gateway.nodes();
    let healthy_nodes = nodes.iter().filter(|n| n.health == "healthy").count();

    Json(HealthResponse {
        status: if healthy_nodes > 0 { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.start_time.elapsed().as_secs(),
        nodes: nodes.len(),
        healthy_nodes,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// GET /v1/nodes
async fn nodes(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.gateway.nodes())
}

/// GET /v1/stats
async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.gateway.stats())
}

/// POST /v1/budget/reset
async fn reset_budget(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.gateway.reset_budget())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::node::NodeConfig;
    use crate::upstream::{FrameStream, Upstream, UpstreamError, UpstreamFrame, UpstreamRequest, Usage};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use futures_util::stream;
    use std::sync::Arc;
    use tower::ServiceExt;

    struct Fixed;

    #[async_trait]
    impl Upstream for Fixed {
        async fn open(&self, _: &NodeConfig, _: &UpstreamRequest) -> Result<FrameStream, UpstreamError> {
            let frames = vec![
                UpstreamFrame::Partial("forty".into()),
                UpstreamFrame::Partial("-two".into()),
                UpstreamFrame::Completed(Usage {
                    input_tokens: 5,
                    output_tokens: 2,
                }),
            ];
            Ok(Box::pin(stream::iter(frames.into_iter().map(Ok::<_, UpstreamError>))))
        }
    }

    fn app() -> Router {
        let config = Config {
            nodes: vec![NodeConfig::new("alpha", "http://alpha", "haiku")],
            ..Config::default()
        };
        router(Gateway::new(&config, Arc::new(Fixed)))
    }

    async fn body_string(response: Response) -> String {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["nodes"], 1);
    }

    #[tokio::test]
    async fn test_ask_streams_sse() {
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/ask")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"context_id": "c1", "question": "meaning?"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;

        let events: Vec<&str> = body
            .lines()
            .filter_map(|l| l.strip_prefix("event: "))
            .collect();
        assert_eq!(events, vec!["hello", "delta", "delta", "done", "complete"]);
        assert!(body.contains(r#"data: {"event":"delta","text_fragment":"forty"}"#));
        assert!(body.contains(r#""cached":false"#));
        assert!(body.contains(r#""cost":"#));
        assert!(body.contains(r#""elapsed":"#));
    }

    #[tokio::test]
    async fn test_ask_rejects_bad_json() {
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/ask")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"context_id": "c1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_nodes_and_budget_reset() {
        let app = app();

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/v1/nodes").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json[0]["id"], "alpha");
        assert_eq!(json[0]["health"], "healthy");

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/budget/reset")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["cost_usd"], 0.0);
    }
}
