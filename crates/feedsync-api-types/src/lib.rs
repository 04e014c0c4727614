//! Wire types shared by the feedsync client and backend.
//!
//! Every type serialises with camelCase keys and RFC 3339 timestamps so the
//! payloads match what the browser client and the workflow glue exchange.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// Feed used when a request does not name one.
pub const GLOBAL_FEED_ID: &str = "GLOBAL";

/// Header carrying the viewer identity on backend requests.
pub const VIEWER_HEADER: &str = "x-viewer-id";

/// Viewer recorded when a request carries no identity.
pub const ANONYMOUS_VIEWER: &str = "anonymous";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModerationStatus {
    Pending,
    Approved,
    Rejected,
}

impl ModerationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ModerationStatus::Pending => "PENDING",
            ModerationStatus::Approved => "APPROVED",
            ModerationStatus::Rejected => "REJECTED",
        }
    }

    /// Approved and rejected posts never change status again.
    pub fn is_terminal(self) -> bool {
        !matches!(self, ModerationStatus::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostRecord {
    pub id: String,
    pub caption: String,
    pub photo_url: String,
    pub moderation_status: ModerationStatus,
    pub like_count: u64,
    pub comment_count: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub owner: String,
    pub feed_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentRecord {
    pub id: String,
    pub post_id: String,
    pub owner: String,
    pub body: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A viewer's like on a post. A viewer holds at most one like per post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LikeRecord {
    pub id: String,
    pub post_id: String,
    pub owner: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavePostInput {
    pub caption: String,
    pub photo_storage_key: String,
    pub photo_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed_id: Option<String>,
}

impl SavePostInput {
    /// Feed the post lands in, falling back to [`GLOBAL_FEED_ID`].
    pub fn feed_id_or_global(&self) -> &str {
        self.feed_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or(GLOBAL_FEED_ID)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    Queued,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavePostReceipt {
    pub post_id: String,
    pub status: SubmissionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub submitted_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateCommentRequest {
    pub body: String,
}

/// Untyped event as it travels over the feed channel.
///
/// The payload shape depends on `kind`; consumers validate it per tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedEventEnvelope {
    pub post_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Wire names of the feed event kinds.
pub mod event_types {
    pub const POST_CREATED: &str = "POST_CREATED";
    pub const POST_UPDATED: &str = "POST_UPDATED";
    pub const MODERATION_UPDATED: &str = "MODERATION_UPDATED";
    pub const COMMENT_CREATED: &str = "COMMENT_CREATED";
    pub const LIKE_UPDATED: &str = "LIKE_UPDATED";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemsResponse<T> {
    pub items: Vec<T>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}
