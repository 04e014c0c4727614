//! HTTP surface of the in-memory backend: the save-post glue, feed reads,
//! comments, likes and the per-feed event stream.

mod handlers;
mod middleware;

use std::sync::Arc;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};

use crate::application::workflow::SavePostWorkflow;
use crate::infra::memory::InMemoryBackend;

pub use handlers::Viewer;
pub use middleware::REQUEST_ID_HEADER;

#[derive(Clone)]
pub struct HttpState {
    pub workflow: Arc<SavePostWorkflow>,
    pub backend: InMemoryBackend,
}

impl HttpState {
    /// Wire the save-post glue to start executions on and publish through
    /// `backend`.
    pub fn new(backend: InMemoryBackend) -> Self {
        let workflow = SavePostWorkflow::new(Arc::new(backend.clone()), Arc::new(backend.clone()));
        Self {
            workflow: Arc::new(workflow),
            backend,
        }
    }
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/posts", post(handlers::save_post))
        .route("/feeds/{feed_id}/posts", get(handlers::list_feed))
        .route("/feeds/{feed_id}/events", get(handlers::feed_events))
        .route(
            "/posts/{post_id}/comments",
            get(handlers::list_comments).post(handlers::create_comment),
        )
        .route(
            "/posts/{post_id}/likes",
            post(handlers::create_like).delete(handlers::delete_like),
        )
        .with_state(state)
        .layer(axum_middleware::from_fn(middleware::log_responses))
        .layer(axum_middleware::from_fn(middleware::set_request_context))
}
