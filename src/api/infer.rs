//! Inference endpoint

use crate::api::{ApiError, AppState};
use crate::core::context::RequestContext;
use crate::core::delivery::deliver;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::response::Sse;
use axum::response::sse::{Event, KeepAlive};
use axum::routing::post;
use axum::{Json, Router};
use futures_util::{Stream, StreamExt};
use log::debug;
use serde::Deserialize;

pub fn router() -> Router<AppState> {
    Router::new().route("/infer", post(infer))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InferRequest {
    pub text: String,
}

/// Streams the generated text for one prompt as server-sent events.
///
/// The result channel is subscribed before the context is admitted, so no message can be
/// published before someone listens. Dropping the response (client disconnect) drops the
/// delivery and with it the subscription.
async fn infer(
    State(state): State<AppState>,
    payload: Result<Json<InferRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let Json(request) = payload?;
    let context = RequestContext::new(request.text, state.max_prompt_length)?;

    let subscription = state
        .broker
        .subscribe(&context.channel())
        .await
        .map_err(ApiError::Subscribe)?;

    let id = context.id();
    state.engine.admit(context).await?;
    debug!("Admitted context {id}");

    let events = deliver(
        subscription,
        state.infer_job_ttl,
        state.shutdown.child_token(),
    )
    .map(|message| Event::default().json_data(message));

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
