//! Save-post requests and the ephemeral submission record.

use feedsync_api_types::{ModerationStatus, SavePostInput};
use time::OffsetDateTime;

use super::error::DomainError;
use super::posts::{Post, PostId};

/// A save-post request that passed validation.
///
/// The caption is trimmed and the feed id resolved, so the placeholder and the
/// workflow input are built from the same values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPost {
    pub caption: String,
    pub photo_storage_key: String,
    pub photo_url: String,
    pub feed_id: String,
}

impl ValidatedPost {
    pub fn parse(input: &SavePostInput) -> Result<Self, DomainError> {
        let caption = input.caption.trim();
        if caption.is_empty() {
            return Err(DomainError::validation("caption", "caption must not be empty"));
        }

        let photo_storage_key = input.photo_storage_key.trim();
        if photo_storage_key.is_empty() {
            return Err(DomainError::validation(
                "photoStorageKey",
                "photo must be uploaded before saving a post",
            ));
        }

        let photo_url = input.photo_url.trim();
        if photo_url.is_empty() {
            return Err(DomainError::validation(
                "photoUrl",
                "photo must be uploaded before saving a post",
            ));
        }

        Ok(Self {
            caption: caption.to_string(),
            photo_storage_key: photo_storage_key.to_string(),
            photo_url: photo_url.to_string(),
            feed_id: input.feed_id_or_global().to_string(),
        })
    }

    pub fn to_input(&self) -> SavePostInput {
        SavePostInput {
            caption: self.caption.clone(),
            photo_storage_key: self.photo_storage_key.clone(),
            photo_url: self.photo_url.clone(),
            feed_id: Some(self.feed_id.clone()),
        }
    }
}

/// One in-flight save operation. Lives until promotion or rollback.
#[derive(Debug, Clone)]
pub struct Submission {
    pub placeholder_id: PostId,
    pub request: ValidatedPost,
    pub started_at: OffsetDateTime,
}

impl Submission {
    pub fn new(placeholder_id: PostId, request: ValidatedPost) -> Self {
        Self {
            placeholder_id,
            request,
            started_at: OffsetDateTime::now_utc(),
        }
    }

    /// Build the PENDING post shown while the workflow is being started.
    pub fn placeholder_post(&self, owner: &str) -> Post {
        Post {
            id: self.placeholder_id.clone(),
            caption: self.request.caption.clone(),
            photo_url: self.request.photo_url.clone(),
            moderation_status: ModerationStatus::Pending,
            like_count: 0,
            comment_count: 0,
            created_at: self.started_at,
            owner: owner.to_string(),
            feed_id: self.request.feed_id.clone(),
        }
    }
}
