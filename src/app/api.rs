//! Control API
//!
//! JSON over HTTP on top of `Controller`, plus the Prometheus /metrics
//! endpoint.
//!
//! ```text
//! GET  /api/nodes     all nodes
//! GET  /api/current   current node or null
//! GET  /api/stats     connection and traffic counters
//! POST /api/select    {"node": "auto" | "<index>" | "<name>"}
//! POST /api/refresh   fetch the subscription again
//! POST /api/check     probe every node
//! GET  /metrics       Prometheus text format
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::controller::Controller;
use super::metrics::REGISTRY;

#[derive(Debug, Deserialize)]
struct SelectRequest {
    node: String,
}

async fn get_nodes(State(controller): State<Arc<Controller>>) -> impl IntoResponse {
    Json(controller.all_nodes())
}

async fn get_current(State(controller): State<Arc<Controller>>) -> impl IntoResponse {
    Json(controller.current_node())
}

async fn get_stats(State(controller): State<Arc<Controller>>) -> impl IntoResponse {
    Json(controller.stats_snapshot())
}

async fn post_select(
    State(controller): State<Arc<Controller>>,
    Json(request): Json<SelectRequest>,
) -> impl IntoResponse {
    let success = controller.select_node(&request.node).await;
    Json(json!({ "success": success }))
}

async fn post_refresh(State(controller): State<Arc<Controller>>) -> impl IntoResponse {
    let success = controller.update_subscription().await.is_ok();
    Json(json!({ "success": success }))
}

async fn post_check(State(controller): State<Arc<Controller>>) -> impl IntoResponse {
    let (online, total) = controller.check_all_nodes().await;
    Json(json!({ "online": online, "total": total }))
}

/// Prometheus metrics endpoint
async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Build the API router
pub fn build_api_router(controller: Arc<Controller>) -> Router {
    Router::new()
        .route("/api/nodes", get(get_nodes))
        .route("/api/current", get(get_current))
        .route("/api/stats", get(get_stats))
        .route("/api/select", post(post_select))
        .route("/api/refresh", post(post_refresh))
        .route("/api/check", post(post_check))
        .route("/metrics", get(get_metrics))
        .with_state(controller)
}

/// Serve the control API until shutdown; bind failures are logged, not fatal
pub async fn start_api_server(
    addr: SocketAddr,
    controller: Arc<Controller>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let app = build_api_router(controller);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!("[api] Failed to bind control API to {}: {}", addr, e);
            return;
        }
    };
    info!("[api] Control API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("[api] Control API shutting down");
        })
        .await
        .unwrap_or_else(|e| {
            warn!("[api] Control API error: {}", e);
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::metrics::init_metrics;
    use crate::config::Config;
    use serde_json::Value;
    use tokio::net::TcpListener;

    async fn serve(controller: Arc<Controller>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_api_router(controller)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_routes() {
        let node = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = node.local_addr().unwrap().port();
        let config = Config::from_json(&format!(
            r#"{{"custom_nodes": [
                {{"name": "a", "server": "127.0.0.1", "server_port": {port}, "password": "hunter2"}}
            ]}}"#
        ))
        .unwrap();
        let controller = Arc::new(Controller::from_config(&config).unwrap());
        let base = serve(controller.clone()).await;
        let http = reqwest::Client::new();

        let current: Value = http.get(format!("{}/api/current", base)).send().await.unwrap().json().await.unwrap();
        assert!(current.is_null());

        let check: Value = http.post(format!("{}/api/check", base)).send().await.unwrap().json().await.unwrap();
        assert_eq!(check, json!({"online": 1, "total": 1}));

        let select: Value = http
            .post(format!("{}/api/select", base))
            .json(&json!({"node": "auto"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(select["success"], true);

        let body = http.get(format!("{}/api/nodes", base)).send().await.unwrap().text().await.unwrap();
        let nodes: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(nodes[0]["name"], "custom-node-a");
        assert_eq!(nodes[0]["status"], "online");
        assert_eq!(nodes[0]["method"], "chacha20-ietf");
        assert!(!body.contains("hunter2"));

        let current: Value = http.get(format!("{}/api/current", base)).send().await.unwrap().json().await.unwrap();
        assert_eq!(current["name"], "custom-node-a");

        let stats: Value = http.get(format!("{}/api/stats", base)).send().await.unwrap().json().await.unwrap();
        assert_eq!(stats["total_connections"], 0);

        // No subscription configured
        let refresh: Value = http.post(format!("{}/api/refresh", base)).send().await.unwrap().json().await.unwrap();
        assert_eq!(refresh["success"], false);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        init_metrics();
        let controller = Arc::new(Controller::from_config(&Config::default()).unwrap());
        controller.check_all_nodes().await;
        let base = serve(controller).await;

        let response = reqwest::get(format!("{}/metrics", base)).await.unwrap();
        assert!(response.status().is_success());
        let text = response.text().await.unwrap();
        assert!(text.contains("nodemux_nodes_total"));
    }
}
