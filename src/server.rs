//! HTTP surface: `POST /predict` and `GET /health`.

use crate::error::{Constraint, FieldError, PredictError, ValidationError};
use crate::features::RawPersonInput;
use crate::predictor::{Config, ExpensePredictor};
use crate::Result;
use anyhow::Context;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::{error, info, warn};

/// Build the application router around a loaded predictor.
pub fn router(predictor: ExpensePredictor) -> Router {
    Router::new()
        .route("/predict", post(predict))
        .route("/health", get(health))
        .with_state(predictor)
}

/// Bind `config.bind_addr` and serve until Ctrl-C.
pub async fn serve(config: &Config, predictor: ExpensePredictor) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, model = %predictor.describe(), "serving predictions");

    axum::serve(listener, router(predictor))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

async fn predict(
    State(predictor): State<ExpensePredictor>,
    body: std::result::Result<Json<RawPersonInput>, JsonRejection>,
) -> Response {
    let raw = match body {
        Ok(Json(raw)) => raw,
        Err(rejection) => {
            warn!(reason = %rejection.body_text(), "rejected request body");
            let err = ValidationError::new(vec![FieldError::new(
                "body",
                Constraint::JsonInvalid,
                rejection.body_text(),
                Value::Null,
            )]);
            return PredictError::from(err).into_response();
        }
    };

    // ONNX Runtime calls are synchronous; keep them off the async workers.
    let result = tokio::task::spawn_blocking(move || predictor.predict(&raw)).await;

    match result {
        Ok(Ok(prediction)) => (StatusCode::OK, Json(prediction)).into_response(),
        Ok(Err(err)) => err.into_response(),
        Err(join_err) => {
            error!(err = %join_err, "prediction task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "detail": "prediction task failed" })),
            )
                .into_response()
        }
    }
}

async fn health(State(predictor): State<ExpensePredictor>) -> Json<Value> {
    Json(json!({ "status": "ok", "model": predictor.describe() }))
}

impl IntoResponse for PredictError {
    fn into_response(self) -> Response {
        match self {
            PredictError::Validation(err) => {
                warn!(%err, "validation failed");
                (StatusCode::UNPROCESSABLE_ENTITY, Json(err)).into_response()
            }
            other => {
                error!(err = %other, "prediction failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "detail": other.to_string() })),
                )
                    .into_response()
            }
        }
    }
}
