use std::convert::Infallible;

use async_stream::stream;
use axum::{
    Json,
    extract::{FromRequestParts, Path, State, rejection::JsonRejection},
    http::{StatusCode, request::Parts},
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
};
use feedsync_api_types::{
    ANONYMOUS_VIEWER, CreateCommentRequest, ItemsResponse, SavePostInput, VIEWER_HEADER,
};
use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use super::HttpState;
use crate::application::error::AppError;
use crate::application::ports::{EventChannel, FeedReader};
use crate::domain::posts::comment_body;

/// Viewer identity taken from the `x-viewer-id` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewer(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Viewer {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let viewer = parts
            .headers
            .get(VIEWER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(ANONYMOUS_VIEWER);
        Ok(Viewer(viewer.to_string()))
    }
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| AppError::validation(rejection.body_text()))
}

pub async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

pub async fn save_post(
    State(state): State<HttpState>,
    Viewer(viewer_id): Viewer,
    payload: Result<Json<SavePostInput>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let input = json_body(payload)?;
    let receipt = state.workflow.save_post(&viewer_id, input).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

pub async fn list_feed(
    State(state): State<HttpState>,
    Path(feed_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let items = state.backend.list_feed(&feed_id).await?;
    Ok(Json(ItemsResponse { items }))
}

pub async fn list_comments(
    State(state): State<HttpState>,
    Path(post_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let items = state.backend.list_comments_for_post(&post_id).await?;
    Ok(Json(ItemsResponse { items }))
}

pub async fn create_comment(
    State(state): State<HttpState>,
    Viewer(viewer_id): Viewer,
    Path(post_id): Path<String>,
    payload: Result<Json<CreateCommentRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let request = json_body(payload)?;
    let body = comment_body(&request.body)?;
    let comment = state.backend.add_comment(&post_id, &viewer_id, body).await?;
    Ok((StatusCode::CREATED, Json(comment)))
}

pub async fn create_like(
    State(state): State<HttpState>,
    Viewer(viewer_id): Viewer,
    Path(post_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let like = state.backend.create_like(&post_id, &viewer_id).await?;
    Ok((StatusCode::CREATED, Json(like)))
}

pub async fn delete_like(
    State(state): State<HttpState>,
    Viewer(viewer_id): Viewer,
    Path(post_id): Path<String>,
) -> Result<StatusCode, AppError> {
    let removed = state.backend.delete_like(&post_id, &viewer_id).await?;
    debug!(post_id = %post_id, removed, "like deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn feed_events(
    State(state): State<HttpState>,
    Path(feed_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let mut events = state.backend.subscribe(&feed_id).await?;
    debug!(feed_id = %feed_id, "event stream subscriber attached");

    let stream = stream! {
        while let Some(next) = events.next().await {
            match next {
                Ok(envelope) => match Event::default().event(&envelope.kind).json_data(&envelope) {
                    Ok(event) => yield Ok::<Event, Infallible>(event),
                    Err(err) => warn!(feed_id = %feed_id, error = %err, "dropping unencodable event"),
                },
                Err(err) => {
                    warn!(feed_id = %feed_id, error = %err, "event stream ended");
                    break;
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
