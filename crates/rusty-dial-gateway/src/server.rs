//! Axum HTTP + WebSocket server.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State, WebSocketUpgrade, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use rusty_dial_core::error::RustyDialError;
use rusty_dial_core::protocol::{CallRef, ControlRequest, ControlResponse, ErrorShape};
use rusty_dial_core::types::CallId;

use crate::bridge::{await_link, serve_socket};
use crate::methods;
use crate::state::GatewayState;

/// How long live calls get to say goodbye on shutdown.
const CALL_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// HTTP status for a control-plane error.
pub fn status_for(err: &RustyDialError) -> StatusCode {
    match err {
        RustyDialError::MissingParam(_) | RustyDialError::InvalidParams(_) | RustyDialError::UnknownAction(_) => {
            StatusCode::BAD_REQUEST
        }
        RustyDialError::InvalidDestination(_) => StatusCode::FORBIDDEN,
        RustyDialError::CallNotFound(_) => StatusCode::NOT_FOUND,
        RustyDialError::CallEnded(_) => StatusCode::CONFLICT,
        RustyDialError::CapacityExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reply(result: rusty_dial_core::error::Result<serde_json::Value>) -> Response {
    match result {
        Ok(data) => (StatusCode::OK, Json(ControlResponse::ok(data))).into_response(),
        Err(err) => (status_for(&err), Json(ControlResponse::err(ErrorShape::from(&err)))).into_response(),
    }
}

/// All gateway routes.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/calls", get(list_calls_handler))
        .route("/calls/{id}/history", get(history_handler))
        .route("/execute", post(execute_handler))
        .route("/ws/calls/{id}", get(call_media_handler))
        .route("/ws/inbound", get(inbound_media_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the configured address and serve until shutdown.
pub async fn start_gateway(state: Arc<GatewayState>, port: u16) -> anyhow::Result<()> {
    let addr = format!("{}:{port}", state.config.gateway_bind());
    let listener = TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}");
    serve(listener, state).await
}

/// Serve on an already bound listener. Runs the duration sweeper alongside.
pub async fn serve(listener: TcpListener, state: Arc<GatewayState>) -> anyhow::Result<()> {
    let sweep_interval = Duration::from_millis(state.config.calls().sweep_interval_ms.max(1));
    let sweeper = state
        .registry
        .spawn_sweeper(sweep_interval, state.shutdown.clone());

    let app = router(state.clone());

    #[cfg(feature = "metrics")]
    let app = {
        let handle = crate::metrics::install_prometheus_recorder()?;
        app.route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        )
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    state.shutdown.cancel();
    if let Err(e) = sweeper.await {
        warn!(error = %e, "Sweeper task failed");
    }
    info!("Gateway stopped");
    Ok(())
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "live_calls": state.registry.live_count(),
        "max_concurrent": state.registry.limits().max_concurrent,
    }))
}

async fn list_calls_handler(State(state): State<Arc<GatewayState>>) -> Response {
    reply(Ok(methods::list_calls(&state)))
}

async fn history_handler(State(state): State<Arc<GatewayState>>, Path(id): Path<String>) -> Response {
    reply(methods::get_history(&state, CallRef { call_id: Some(id) }))
}

async fn execute_handler(
    State(state): State<Arc<GatewayState>>,
    body: Result<Json<ControlRequest>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(request)) => reply(methods::execute(&state, request).await),
        Err(rejection) => reply(Err(RustyDialError::InvalidParams(rejection.body_text()))),
    }
}

/// Media socket of a dialed call.
async fn call_media_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
) -> Response {
    let call_id: CallId = match id.parse() {
        Ok(id) => id,
        Err(_) => return reply(Err(RustyDialError::InvalidParams(format!("'{id}' is not a call id")))),
    };
    match state.bridge.claim(call_id) {
        Some(slot) => {
            let bridge = state.bridge.clone();
            ws.on_upgrade(move |socket| serve_socket(bridge, socket, call_id, slot))
        }
        None => match state.registry.get(call_id) {
            // Live but not dialing: media is already connected.
            Ok(_) => reply(Err(RustyDialError::InvalidParams(format!(
                "call {call_id} already has a media socket"
            )))),
            Err(e) => reply(Err(e)),
        },
    }
}

#[derive(Debug, Deserialize)]
struct InboundQuery {
    #[serde(default)]
    from: String,
    #[serde(default)]
    to: String,
}

/// Media socket of an inbound call. Rejected before any audio flows when
/// the gateway is at capacity.
async fn inbound_media_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<InboundQuery>,
) -> Response {
    let (slot, connected) = oneshot::channel();
    match methods::accept_inbound(&state, &query.from, &query.to, await_link(connected)) {
        Ok(call_id) => {
            let bridge = state.bridge.clone();
            ws.on_upgrade(move |socket| serve_socket(bridge, socket, call_id, slot))
        }
        Err(e) => reply(Err(e)),
    }
}

async fn shutdown_signal(state: Arc<GatewayState>) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => {
                error!(error = %e, "Failed to install CTRL+C handler");
                state.shutdown.cancelled().await;
            }
        },
        _ = state.shutdown.cancelled() => info!("Shutdown requested"),
    }
    state.shutdown.cancel();
    // Ending calls closes their media sockets, which lets the server drain.
    state.registry.shutdown(CALL_SHUTDOWN_GRACE).await;
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::testing::collaborators;
    use rusty_dial_core::config::Config;

    fn app() -> Router {
        router(Arc::new(GatewayState::new(Config::default(), collaborators()).unwrap()))
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&RustyDialError::MissingParam("to".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&RustyDialError::InvalidDestination("x".into())), StatusCode::FORBIDDEN);
        assert_eq!(status_for(&RustyDialError::CallNotFound(CallId::new())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&RustyDialError::CallEnded(CallId::new())), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&RustyDialError::CapacityExceeded { live: 5, ceiling: 5 }),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[tokio::test]
    async fn test_health() {
        let resp = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["max_concurrent"], 5);
    }

    #[tokio::test]
    async fn test_execute_rejects_malformed_body() {
        let resp = app()
            .oneshot(
                Request::post("/execute")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "invalid_params");
        assert!(body["_security_notice"].is_string());
    }

    #[tokio::test]
    async fn test_history_of_unknown_call_is_404() {
        let uri = format!("/calls/{}/history", CallId::new());
        let resp = app().oneshot(Request::get(uri).body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["error"]["code"], "call_not_found");
    }
}
