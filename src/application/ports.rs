//! Traits describing the external collaborators of the feed lifecycle.
//!
//! The client side talks to a [`WorkflowTrigger`], a [`FeedReader`], a
//! [`FeedWriter`] and an [`EventChannel`]. The save-post glue on the backend side talks to a
//! [`WorkflowStarter`] and a [`FeedPublisher`].

use async_trait::async_trait;
use feedsync_api_types::{
    CommentRecord, FeedEventEnvelope, LikeRecord, PostRecord, SavePostInput, SavePostReceipt,
};
use futures::stream::BoxStream;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("request throttled by backend")]
    Throttled,
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("resource not found")]
    NotFound,
    #[error("event channel closed")]
    ChannelClosed,
}

impl GatewayError {
    pub fn network(err: impl std::fmt::Display) -> Self {
        Self::Network(err.to_string())
    }

    pub fn decode(err: impl std::fmt::Display) -> Self {
        Self::Decode(err.to_string())
    }

    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }
}

/// Stream of raw events for one feed. Dropping it ends the subscription.
pub type EventStream = BoxStream<'static, Result<FeedEventEnvelope, GatewayError>>;

/// Starts the asynchronous save-post workflow and hands back the post id.
#[async_trait]
pub trait WorkflowTrigger: Send + Sync {
    async fn start_save_post_workflow(
        &self,
        input: SavePostInput,
    ) -> Result<SavePostReceipt, GatewayError>;
}

/// Authoritative reads used to resynchronise local state.
#[async_trait]
pub trait FeedReader: Send + Sync {
    /// Posts of one feed, newest first.
    async fn list_feed(&self, feed_id: &str) -> Result<Vec<PostRecord>, GatewayError>;

    async fn list_comments_for_post(
        &self,
        post_id: &str,
    ) -> Result<Vec<CommentRecord>, GatewayError>;
}

/// Writes on existing posts, made as the adapter's viewer.
#[async_trait]
pub trait FeedWriter: Send + Sync {
    async fn add_comment(&self, post_id: &str, body: &str) -> Result<CommentRecord, GatewayError>;

    async fn create_like(&self, post_id: &str) -> Result<LikeRecord, GatewayError>;

    async fn delete_like(&self, post_id: &str) -> Result<(), GatewayError>;
}

/// Push channel of status-change events for a feed.
#[async_trait]
pub trait EventChannel: Send + Sync {
    async fn subscribe(&self, feed_id: &str) -> Result<EventStream, GatewayError>;
}

/// Input handed to the moderation workflow when a post is saved.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecutionInput {
    pub request_id: String,
    pub viewer_id: String,
    pub post_id: String,
    pub post: WorkflowPost,
    pub timestamps: WorkflowTimestamps,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowPost {
    pub caption: String,
    pub photo_storage_key: String,
    pub photo_url: String,
    pub feed_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowTimestamps {
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated: OffsetDateTime,
}

/// Starts executions of the external moderation state machine.
#[async_trait]
pub trait WorkflowStarter: Send + Sync {
    /// Returns the execution identifier.
    async fn start_execution(&self, input: WorkflowExecutionInput) -> Result<String, GatewayError>;
}

/// Fans feed events out to subscribers of a feed.
#[async_trait]
pub trait FeedPublisher: Send + Sync {
    async fn publish(&self, feed_id: &str, event: FeedEventEnvelope) -> Result<(), GatewayError>;
}
