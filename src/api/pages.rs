//! Index page and health check

use crate::api::{ApiError, AppState};
use crate::core::batcher::StatsSnapshot;
use axum::Json;
use axum::extract::State;
use axum::response::Html;
use minijinja::{Environment, context};
use serde::Serialize;

const INDEX_TEMPLATE: &str = "index.html";

pub(crate) fn templates() -> Result<Environment<'static>, minijinja::Error> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.add_template(
        INDEX_TEMPLATE,
        include_str!("../../templates/index.html"),
    )?;
    Ok(env)
}

pub async fn index(State(state): State<AppState>) -> Result<Html<String>, ApiError> {
    let page = state
        .templates
        .get_template(INDEX_TEMPLATE)?
        .render(context! { max_prompt_length => state.max_prompt_length })?;
    Ok(Html(page))
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    #[serde(flatten)]
    pub stats: StatsSnapshot,
}

pub async fn healthcheck(State(state): State<AppState>) -> Result<Json<Health>, ApiError> {
    if !state.engine.is_running() {
        return Err(ApiError::Unhealthy);
    }

    Ok(Json(Health {
        status: "ok",
        stats: state.engine.stats(),
    }))
}
