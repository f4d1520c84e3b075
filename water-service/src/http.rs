use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use water_client::UsageReading;

use crate::pipeline::UsagePipeline;

#[derive(Serialize)]
struct DailyWaterResponse {
    #[serde(flatten)]
    reading: UsageReading,
    cached: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    cached: bool,
}

pub fn router(pipeline: Arc<UsagePipeline>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/water/daily", get(daily_water))
        .with_state(pipeline)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn daily_water(State(pipeline): State<Arc<UsagePipeline>>) -> Response {
    match pipeline.daily_usage().await {
        Ok(daily) => Json(DailyWaterResponse {
            reading: daily.reading,
            cached: daily.cached,
        })
        .into_response(),
        Err(e) => {
            tracing::error!(kind = e.kind(), error = %e, "daily water request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                    cached: false,
                }),
            )
                .into_response()
        }
    }
}
