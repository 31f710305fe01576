//! Scheduler entry points: `POST /cron/collect` and the two aggregation routes.
//!
//! Every route requires `Authorization: Bearer <CRON_SECRET>`.

use axum::{
    extract::{Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::aggregate::{DailyAggregator, HourlyAggregator, RunDate};

use super::AppState;

// ---

#[derive(Debug, Deserialize)]
struct DateQuery {
    date: Option<NaiveDate>,
}

pub fn router(state: AppState) -> Router<AppState> {
    // ---
    Router::new()
        .route("/cron/collect", post(collect))
        .route("/cron/aggregate/hourly", post(aggregate_hourly))
        .route("/cron/aggregate/daily", post(aggregate_daily))
        .route_layer(middleware::from_fn_with_state(state, require_cron_secret))
}

async fn require_cron_secret(State(state): State<AppState>, req: Request, next: Next) -> Response {
    // ---
    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| constant_time_eq(token.as_bytes(), state.cron_secret.as_bytes()));

    if !authorized {
        tracing::warn!(path = %req.uri().path(), "Rejected cron call without a valid secret");
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" }))).into_response();
    }
    next.run(req).await
}

/// Compare two secrets without exiting early on the first differing byte.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn failure(context: &str, err: anyhow::Error) -> Response {
    // ---
    tracing::error!(error = %format!("{err:#}"), "{}", context);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": context, "detail": format!("{err:#}") })),
    )
        .into_response()
}

async fn collect(State(state): State<AppState>) -> Response {
    // ---
    tracing::info!("POST /cron/collect");
    match state.pipeline.collect(Utc::now()).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => failure("collection failed", e),
    }
}

async fn aggregate_hourly(
    State(state): State<AppState>,
    Query(query): Query<DateQuery>,
) -> Response {
    // ---
    let target = RunDate::or_default(query.date, Utc::now());
    tracing::info!(date = ?query.date, "POST /cron/aggregate/hourly");
    match HourlyAggregator::new(state.store.clone()).run(target).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => failure("hourly aggregation failed", e),
    }
}

async fn aggregate_daily(
    State(state): State<AppState>,
    Query(query): Query<DateQuery>,
) -> Response {
    // ---
    let target = RunDate::or_default(query.date, Utc::now());
    tracing::info!(date = ?query.date, "POST /cron/aggregate/daily");
    match DailyAggregator::new(state.store.clone()).run(target).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => failure("daily aggregation failed", e),
    }
}
