//! Post identity and the feed-visible post record.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use feedsync_api_types::{ModerationStatus, PostRecord};
use time::OffsetDateTime;

use super::error::DomainError;

/// Prefix carried by every locally-synthesised post id.
pub const PLACEHOLDER_PREFIX: &str = "temp-";

/// Identifier of a post in the feed: either a placeholder or a backend id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PostId(String);

impl PostId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_placeholder(&self) -> bool {
        self.0.starts_with(PLACEHOLDER_PREFIX)
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PostId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for PostId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl PartialEq<str> for PostId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for PostId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

static PROCESS_PLACEHOLDERS: OnceLock<Arc<PlaceholderIds>> = OnceLock::new();

/// Monotonic source of placeholder ids (`temp-1`, `temp-2`, ...).
///
/// Ids are never reused for the lifetime of the generator, so a promoted
/// placeholder id cannot reappear in the feed it was issued for.
#[derive(Debug)]
pub struct PlaceholderIds {
    next: AtomicU64,
}

impl PlaceholderIds {
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// The generator shared by every coordinator in the process.
    pub fn process() -> Arc<PlaceholderIds> {
        PROCESS_PLACEHOLDERS
            .get_or_init(|| Arc::new(PlaceholderIds::new()))
            .clone()
    }

    pub fn next_id(&self) -> PostId {
        let value = self.next.fetch_add(1, Ordering::Relaxed);
        PostId(format!("{PLACEHOLDER_PREFIX}{value}"))
    }
}

/// Trimmed body of a new comment; blank bodies are rejected.
pub fn comment_body(body: &str) -> Result<&str, DomainError> {
    let body = body.trim();
    if body.is_empty() {
        return Err(DomainError::validation("body", "comment body must not be empty"));
    }
    Ok(body)
}

impl Default for PlaceholderIds {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Post {
    pub id: PostId,
    pub caption: String,
    pub photo_url: String,
    pub moderation_status: ModerationStatus,
    pub like_count: u64,
    pub comment_count: u64,
    pub created_at: OffsetDateTime,
    pub owner: String,
    pub feed_id: String,
}

impl Post {
    pub fn is_placeholder(&self) -> bool {
        self.id.is_placeholder()
    }

    pub fn is_pending(&self) -> bool {
        self.moderation_status == ModerationStatus::Pending
    }

    pub fn to_record(&self) -> PostRecord {
        PostRecord {
            id: self.id.to_string(),
            caption: self.caption.clone(),
            photo_url: self.photo_url.clone(),
            moderation_status: self.moderation_status,
            like_count: self.like_count,
            comment_count: self.comment_count,
            created_at: self.created_at,
            owner: self.owner.clone(),
            feed_id: self.feed_id.clone(),
        }
    }
}

impl From<PostRecord> for Post {
    fn from(record: PostRecord) -> Self {
        Self {
            id: PostId(record.id),
            caption: record.caption,
            photo_url: record.photo_url,
            moderation_status: record.moderation_status,
            like_count: record.like_count,
            comment_count: record.comment_count,
            created_at: record.created_at,
            owner: record.owner,
            feed_id: record.feed_id,
        }
    }
}
