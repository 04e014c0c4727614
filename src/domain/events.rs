//! Feed events.
//!
//! Events arrive as untyped [`FeedEventEnvelope`]s; decoding validates the
//! payload for each event type so the listener only ever sees well-formed
//! [`FeedEvent`]s.

use feedsync_api_types::{FeedEventEnvelope, ModerationStatus, event_types};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use super::error::DomainError;
use super::posts::PostId;

/// A decoded feed event.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEvent {
    /// Post the event refers to.
    pub post_id: PostId,
    /// Event type together with its validated payload.
    pub kind: FeedEventKind,
    /// When the backend emitted the event.
    pub created_at: OffsetDateTime,
}

impl FeedEvent {
    pub fn new(post_id: impl Into<PostId>, kind: FeedEventKind) -> Self {
        Self {
            post_id: post_id.into(),
            kind,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn to_envelope(&self) -> FeedEventEnvelope {
        FeedEventEnvelope {
            post_id: self.post_id.to_string(),
            kind: self.kind.wire_name().to_string(),
            payload: self.kind.payload(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEventKind {
    /// A post entered the feed.
    PostCreated,
    /// A post changed in a way that needs a full refresh.
    PostUpdated,
    /// The moderation workflow decided on a post.
    ModerationUpdated {
        status: ModerationStatus,
        reason: Option<String>,
    },
    /// A comment was added to a post.
    CommentCreated { comment_id: Option<String> },
    /// Likes on a post changed.
    LikeUpdated { like_count: Option<u64> },
}

impl FeedEventKind {
    pub fn wire_name(&self) -> &'static str {
        match self {
            FeedEventKind::PostCreated => event_types::POST_CREATED,
            FeedEventKind::PostUpdated => event_types::POST_UPDATED,
            FeedEventKind::ModerationUpdated { .. } => event_types::MODERATION_UPDATED,
            FeedEventKind::CommentCreated { .. } => event_types::COMMENT_CREATED,
            FeedEventKind::LikeUpdated { .. } => event_types::LIKE_UPDATED,
        }
    }

    fn payload(&self) -> Value {
        let payload = match self {
            FeedEventKind::PostCreated | FeedEventKind::PostUpdated => return Value::Null,
            FeedEventKind::ModerationUpdated { status, reason } => {
                serde_json::to_value(ModerationPayload {
                    status: *status,
                    reason: reason.clone(),
                })
            }
            FeedEventKind::CommentCreated { comment_id } => {
                serde_json::to_value(CommentPayload {
                    comment_id: comment_id.clone(),
                })
            }
            FeedEventKind::LikeUpdated { like_count } => serde_json::to_value(LikePayload {
                like_count: *like_count,
            }),
        };
        payload.unwrap_or(Value::Null)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModerationPayload {
    status: ModerationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    comment_id: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LikePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    like_count: Option<u64>,
}

fn required_payload<T: DeserializeOwned>(kind: &str, payload: Value) -> Result<T, DomainError> {
    if payload.is_null() {
        return Err(DomainError::malformed_event(kind, "payload is required"));
    }
    serde_json::from_value(payload).map_err(|err| DomainError::malformed_event(kind, err.to_string()))
}

fn optional_payload<T: DeserializeOwned + Default>(
    kind: &str,
    payload: Value,
) -> Result<T, DomainError> {
    if payload.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(payload).map_err(|err| DomainError::malformed_event(kind, err.to_string()))
}

impl TryFrom<FeedEventEnvelope> for FeedEvent {
    type Error = DomainError;

    fn try_from(envelope: FeedEventEnvelope) -> Result<Self, Self::Error> {
        let FeedEventEnvelope {
            post_id,
            kind,
            payload,
            created_at,
        } = envelope;

        if post_id.trim().is_empty() {
            return Err(DomainError::malformed_event(kind, "postId must not be empty"));
        }

        let kind = match kind.as_str() {
            event_types::POST_CREATED => FeedEventKind::PostCreated,
            event_types::POST_UPDATED => FeedEventKind::PostUpdated,
            event_types::MODERATION_UPDATED => {
                let payload: ModerationPayload = required_payload(&kind, payload)?;
                FeedEventKind::ModerationUpdated {
                    status: payload.status,
                    reason: payload.reason,
                }
            }
            event_types::COMMENT_CREATED => {
                let payload: CommentPayload = optional_payload(&kind, payload)?;
                FeedEventKind::CommentCreated {
                    comment_id: payload.comment_id,
                }
            }
            event_types::LIKE_UPDATED => {
                let payload: LikePayload = optional_payload(&kind, payload)?;
                FeedEventKind::LikeUpdated {
                    like_count: payload.like_count,
                }
            }
            _ => return Err(DomainError::UnknownEvent(kind.clone())),
        };

        Ok(Self {
            post_id: PostId::from(post_id),
            kind,
            created_at,
        })
    }
}
