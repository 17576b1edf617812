//! API routes
//!
//! Each handler extracts, stamps the clock, and delegates to the engine.

use axum::{
    extract::{Path, Query, State as AxumState},
    routing::{get, patch, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::{ApiError, ApiResult};
use crate::engine::{BasicPatchInput, Engine};
use crate::gateway::{AccountSummary, Position};
use crate::models::events::ConditionStateRow;
use crate::models::{
    Condition, Strategy, StrategyEvent, TradeAction, TradeInstruction, TradeLogEntry,
};
use crate::validate::NewStrategyInput;

pub fn router(engine: Engine) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/strategies", post(create_strategy).get(list_strategies))
        .route(
            "/api/strategies/:id",
            get(get_strategy).delete(delete_strategy),
        )
        .route("/api/strategies/:id/basic", patch(patch_basic))
        .route("/api/strategies/:id/conditions", put(put_conditions))
        .route("/api/strategies/:id/actions", put(put_actions))
        .route("/api/strategies/:id/activate", post(activate))
        .route("/api/strategies/:id/pause", post(pause))
        .route("/api/strategies/:id/resume", post(resume))
        .route("/api/strategies/:id/cancel", post(cancel))
        .route("/api/strategies/:id/events", get(strategy_events))
        .route(
            "/api/strategies/:id/conditions/state",
            get(condition_states),
        )
        .route("/api/events", get(global_events))
        .route("/api/portfolio", get(portfolio))
        .route("/api/positions", get(positions))
        .route("/api/instructions", get(instructions))
        .route("/api/trade-logs/:trade_id", get(trade_logs))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(engine)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    gateway: &'static str,
    timestamp: String,
}

async fn health(AxumState(engine): AxumState<Engine>) -> Json<HealthResponse> {
    let gateway = match engine.gateway.health_check().await {
        Ok(()) => "up",
        Err(_) => "down",
    };
    Json(HealthResponse {
        status: "ok",
        gateway,
        timestamp: Utc::now().to_rfc3339(),
    })
}

async fn create_strategy(
    AxumState(engine): AxumState<Engine>,
    Json(input): Json<NewStrategyInput>,
) -> ApiResult<Json<Strategy>> {
    Ok(Json(engine.create_strategy(input, Utc::now())?))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
}

async fn list_strategies(
    AxumState(engine): AxumState<Engine>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Strategy>>> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            crate::models::StrategyStatus::parse(raw).ok_or_else(|| {
                ApiError(crate::error::EngineError::Validation(format!(
                    "unknown status {raw}"
                )))
            })?,
        ),
        None => None,
    };
    Ok(Json(engine.store.list(status)?))
}

async fn get_strategy(
    AxumState(engine): AxumState<Engine>,
    Path(id): Path<String>,
) -> ApiResult<Json<Strategy>> {
    Ok(Json(engine.store.get(&id)?))
}

async fn delete_strategy(
    AxumState(engine): AxumState<Engine>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    engine.delete_strategy(&id, Utc::now())?;
    Ok(Json(serde_json::json!({"deleted": id})))
}

async fn patch_basic(
    AxumState(engine): AxumState<Engine>,
    Path(id): Path<String>,
    Json(input): Json<BasicPatchInput>,
) -> ApiResult<Json<Strategy>> {
    Ok(Json(engine.patch_basic(&id, input, Utc::now())?))
}

async fn put_conditions(
    AxumState(engine): AxumState<Engine>,
    Path(id): Path<String>,
    Json(conditions): Json<Vec<Condition>>,
) -> ApiResult<Json<Strategy>> {
    Ok(Json(engine.put_conditions(&id, conditions, Utc::now())?))
}

#[derive(Debug, Deserialize)]
struct PutActionsBody {
    trade_action: Option<TradeAction>,
}

async fn put_actions(
    AxumState(engine): AxumState<Engine>,
    Path(id): Path<String>,
    Json(body): Json<PutActionsBody>,
) -> ApiResult<Json<Strategy>> {
    Ok(Json(engine.put_actions(&id, body.trade_action, Utc::now())?))
}

async fn activate(
    AxumState(engine): AxumState<Engine>,
    Path(id): Path<String>,
) -> ApiResult<Json<Strategy>> {
    Ok(Json(engine.activate(&id, Utc::now()).await?))
}

async fn pause(
    AxumState(engine): AxumState<Engine>,
    Path(id): Path<String>,
) -> ApiResult<Json<Strategy>> {
    Ok(Json(engine.pause(&id, Utc::now())?))
}

async fn resume(
    AxumState(engine): AxumState<Engine>,
    Path(id): Path<String>,
) -> ApiResult<Json<Strategy>> {
    Ok(Json(engine.resume(&id, Utc::now())?))
}

async fn cancel(
    AxumState(engine): AxumState<Engine>,
    Path(id): Path<String>,
) -> ApiResult<Json<Strategy>> {
    Ok(Json(engine.cancel(&id, Utc::now())?))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
}

async fn strategy_events(
    AxumState(engine): AxumState<Engine>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Vec<StrategyEvent>>> {
    // 404 on unknown ids rather than an empty stream.
    engine.store.get(&id)?;
    Ok(Json(
        engine.store.list_events(&id, query.limit.unwrap_or(100))?,
    ))
}

async fn condition_states(
    AxumState(engine): AxumState<Engine>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<ConditionStateRow>>> {
    engine.store.get(&id)?;
    Ok(Json(engine.store.condition_states(&id)?))
}

async fn global_events(
    AxumState(engine): AxumState<Engine>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Vec<StrategyEvent>>> {
    Ok(Json(
        engine.store.recent_events(query.limit.unwrap_or(100))?,
    ))
}

async fn portfolio(AxumState(engine): AxumState<Engine>) -> ApiResult<Json<AccountSummary>> {
    Ok(Json(engine.gateway.account_summary().await?))
}

#[derive(Debug, Deserialize)]
struct PositionsQuery {
    sec_type: Option<String>,
    symbol: Option<String>,
}

async fn positions(
    AxumState(engine): AxumState<Engine>,
    Query(query): Query<PositionsQuery>,
) -> ApiResult<Json<Vec<Position>>> {
    let mut positions = engine.gateway.positions().await?;
    if let Some(sec_type) = &query.sec_type {
        positions.retain(|p| p.sec_type.eq_ignore_ascii_case(sec_type));
    }
    if let Some(symbol) = &query.symbol {
        positions.retain(|p| p.symbol.eq_ignore_ascii_case(symbol));
    }
    Ok(Json(positions))
}

async fn instructions(
    AxumState(engine): AxumState<Engine>,
) -> ApiResult<Json<Vec<TradeInstruction>>> {
    Ok(Json(engine.store.active_instructions()?))
}

async fn trade_logs(
    AxumState(engine): AxumState<Engine>,
    Path(trade_id): Path<String>,
) -> ApiResult<Json<Vec<TradeLogEntry>>> {
    Ok(Json(engine.store.trade_logs(&trade_id)?))
}
