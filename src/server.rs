//! Ambient HTTP surface (SPEC_FULL §6): a thin axum front end whose sole
//! job is to host the peer WebSocket upgrade endpoint and a liveness
//! probe. The HTTP/CLI front end proper is out of spec scope.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;

use crate::app_state::AppState;
use crate::engine;
use crate::event::Event;
use crate::transport::{self, AxumWsTransport, Transport};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "node_id": state.config.node_id,
        "metrics": state.metrics.snapshot(),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = token else {
        return (StatusCode::UNAUTHORIZED, "missing bearer token").into_response();
    };

    match engine::validate_handshake(token, &state.config.jwt_secret) {
        Ok((peer_node_id, peer_url)) => {
            let handle = state.engine_handle.clone();
            ws.on_upgrade(move |socket| async move {
                let transport: Box<dyn Transport> = Box::new(AxumWsTransport::new(socket));
                let (outbox, join) =
                    transport::spawn_connection(transport, peer_url.clone(), handle.clone());
                handle
                    .send(Event::IncomingConnection { peer_node_id, peer_url, outbox, join })
                    .await;
            })
        }
        Err(e) => {
            tracing::warn!(error = %e, "rejected websocket upgrade: invalid bearer token");
            (StatusCode::UNAUTHORIZED, e.to_string()).into_response()
        }
    }
}
