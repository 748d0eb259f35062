//! HTTP surface: the index page, the health check and the inference endpoint.

use crate::core::batcher::BatchingEngine;
use crate::core::error::{AdmissionError, ContextError};
use crate::core::traits::Broker;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use log::error;
use minijinja::Environment;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

pub mod infer;
pub mod pages;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<BatchingEngine>,
    pub broker: Arc<dyn Broker>,
    /// How long a delivery waits for the next message.
    pub infer_job_ttl: Duration,
    pub max_prompt_length: usize,
    /// Cancelled on server shutdown; every delivery listens on a child token.
    pub shutdown: CancellationToken,
    templates: Arc<Environment<'static>>,
}

impl AppState {
    pub fn new(
        engine: Arc<BatchingEngine>,
        broker: Arc<dyn Broker>,
        infer_job_ttl: Duration,
        max_prompt_length: usize,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            engine,
            broker,
            infer_job_ttl,
            max_prompt_length,
            shutdown,
            templates: Arc::new(pages::templates()?),
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(pages::index))
        .route("/healthcheck", get(pages::healthcheck))
        .nest("/api/v1", infer::router())
        .layer(
            CorsLayer::new()
                .allow_headers(Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_origin([
                    HeaderValue::from_static("http://localhost:3000"),
                    HeaderValue::from_static("http://localhost:5173"),
                ]),
        )
        .with_state(state)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{}", .0.body_text())]
    InvalidBody(#[from] JsonRejection),
    #[error(transparent)]
    InvalidPrompt(#[from] ContextError),
    #[error(transparent)]
    NotAdmitted(#[from] AdmissionError),
    #[error("failed to subscribe to results: {0:#}")]
    Subscribe(anyhow::Error),
    #[error("API unhealthy")]
    Unhealthy,
    #[error("failed to render page: {0}")]
    Template(#[from] minijinja::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidBody(_) | ApiError::InvalidPrompt(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ApiError::NotAdmitted(_) | ApiError::Subscribe(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Unhealthy | ApiError::Template(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("{self}");
        }
        (status, Json(serde_json::json!({ "detail": self.to_string() }))).into_response()
    }
}
