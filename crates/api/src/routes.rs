use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use mtbridge_core::{BridgeError, LimitOrderRequest, MarketOrderRequest, ModifyOrderRequest};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Health
        .route("/health", get(health_check))
        .route("/ping", get(ping))
        // Account
        .route("/balance", get(get_balance))
        // Market orders
        .route("/orders", get(list_open_orders))
        .route("/orders/market", post(place_market_order))
        .route("/orders/close-all", post(close_all_market_orders))
        .route(
            "/orders/{ticket}",
            delete(close_market_order).patch(modify_order),
        )
        // Pending orders
        .route("/orders/limit", post(place_limit_order))
        .route("/orders/pending", get(list_pending_orders))
        .route("/orders/pending/close-all", post(close_all_pending_orders))
        .route("/orders/pending/{ticket}", delete(close_pending_order))
        // Bridge observability
        .route(
            "/bridge/pending",
            get(pending_command).delete(clear_pending_command),
        )
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Maps bridge failures onto HTTP statuses.
struct ApiError(BridgeError);

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BridgeError::Busy(_) => StatusCode::CONFLICT,
            BridgeError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            BridgeError::Rejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            BridgeError::InvalidResult { .. } => StatusCode::BAD_GATEWAY,
            BridgeError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
            BridgeError::Cleared(_)
            | BridgeError::MalformedPayload(_)
            | BridgeError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::warn!(status = %status, error = %self.0, "Bridge call failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let pending = state.bridge.pending_command().await;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "pending": pending,
    }))
}

async fn ping(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    state.bridge.ping().await?;
    Ok(Json(json!({ "status": "pong" })))
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

async fn get_balance(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let balance = state.bridge.get_balance().await?;
    Ok(Json(json!({ "balance": balance })))
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

async fn list_open_orders(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.bridge.get_open_orders().await?))
}

async fn list_pending_orders(
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.bridge.get_pending_orders().await?))
}

async fn place_market_order(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MarketOrderRequest>,
) -> ApiResult<impl IntoResponse> {
    let ticket = state.bridge.place_market_order(req).await?;
    Ok((StatusCode::CREATED, Json(json!({ "ticket": ticket }))))
}

async fn place_limit_order(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LimitOrderRequest>,
) -> ApiResult<impl IntoResponse> {
    let ticket = state.bridge.place_limit_order(req).await?;
    Ok((StatusCode::CREATED, Json(json!({ "ticket": ticket }))))
}

async fn close_market_order(
    State(state): State<Arc<AppState>>,
    Path(ticket): Path<u64>,
) -> ApiResult<impl IntoResponse> {
    let result = state.bridge.close_order(ticket).await?;
    Ok(Json(json!({ "ticket": ticket, "result": result })))
}

async fn close_pending_order(
    State(state): State<Arc<AppState>>,
    Path(ticket): Path<u64>,
) -> ApiResult<impl IntoResponse> {
    let result = state.bridge.close_pending_order(ticket).await?;
    Ok(Json(json!({ "ticket": ticket, "result": result })))
}

#[derive(Deserialize)]
struct ModifyOrderBody {
    #[serde(default)]
    price: Option<Decimal>,
    #[serde(default)]
    stop_loss: Option<Decimal>,
    #[serde(default)]
    take_profit: Option<Decimal>,
}

async fn modify_order(
    State(state): State<Arc<AppState>>,
    Path(ticket): Path<u64>,
    Json(body): Json<ModifyOrderBody>,
) -> ApiResult<impl IntoResponse> {
    let request = ModifyOrderRequest {
        ticket,
        price: body.price,
        stop_loss: body.stop_loss,
        take_profit: body.take_profit,
    };
    let result = state.bridge.modify_order(request).await?;
    Ok(Json(json!({ "ticket": ticket, "result": result })))
}

async fn close_all_market_orders(
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    let result = state.bridge.close_all_market_orders().await?;
    Ok(Json(json!({ "result": result })))
}

async fn close_all_pending_orders(
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    let result = state.bridge.close_all_pending_orders().await?;
    Ok(Json(json!({ "result": result })))
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

async fn pending_command(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "pending": state.bridge.pending_command().await }))
}

async fn clear_pending_command(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cleared = state.bridge.clear_pending_command().await;
    if let Some(cleared) = &cleared {
        tracing::warn!(id = %cleared.id, command = %cleared.command, "Pending command cleared via API");
    }
    Json(json!({ "cleared": cleared }))
}
