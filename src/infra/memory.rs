//! In-process backend: post and comment storage, per-feed event fan-out and a
//! stand-in moderation workflow that decides on posts after a delay.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use feedsync_api_types::{
    CommentRecord, FeedEventEnvelope, LikeRecord, ModerationStatus, PostRecord,
};
use futures::StreamExt;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::lock::recover;
use crate::application::ports::{
    EventChannel, EventStream, FeedPublisher, FeedReader, FeedWriter, GatewayError,
    WorkflowExecutionInput, WorkflowStarter,
};
use crate::config::WorkflowSettings;
use crate::domain::events::{FeedEvent, FeedEventKind};

const SOURCE: &str = "infra::memory";
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct MemoryBackendOptions {
    pub state_machine: String,
    pub moderation_delay: Duration,
    /// Lower-case terms that get a caption rejected.
    pub blocked_terms: Vec<String>,
}

impl Default for MemoryBackendOptions {
    fn default() -> Self {
        Self {
            state_machine: "save-post".to_string(),
            moderation_delay: Duration::from_millis(1_500),
            blocked_terms: Vec::new(),
        }
    }
}

impl From<&WorkflowSettings> for MemoryBackendOptions {
    fn from(settings: &WorkflowSettings) -> Self {
        Self {
            state_machine: settings.state_machine.clone(),
            moderation_delay: settings.moderation_delay,
            blocked_terms: settings.blocked_terms.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    /// Newest first across all feeds.
    posts: Vec<PostRecord>,
    comments: HashMap<String, Vec<CommentRecord>>,
    likes: HashMap<String, Vec<LikeRecord>>,
}

struct Inner {
    options: MemoryBackendOptions,
    state: RwLock<MemoryState>,
    channels: Mutex<HashMap<String, broadcast::Sender<FeedEventEnvelope>>>,
}

#[derive(Clone)]
pub struct InMemoryBackend {
    inner: Arc<Inner>,
}

impl InMemoryBackend {
    pub fn new(options: MemoryBackendOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                state: RwLock::new(MemoryState::default()),
                channels: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Store a post as-is, newest first. Used to pre-populate demo feeds.
    pub fn seed(&self, post: PostRecord) {
        self.inner.write_state().posts.insert(0, post);
    }

    pub fn post(&self, post_id: &str) -> Option<PostRecord> {
        self.inner
            .read_state()
            .posts
            .iter()
            .find(|post| post.id == post_id)
            .cloned()
    }

    /// Feeds that currently hold an event channel.
    pub fn channel_count(&self) -> usize {
        self.inner.channels().len()
    }

    /// Number of live subscribers on `feed_id`.
    pub fn subscriber_count(&self, feed_id: &str) -> usize {
        self.inner
            .channels()
            .get(feed_id)
            .map(broadcast::Sender::receiver_count)
            .unwrap_or(0)
    }

    /// Append a comment and announce it on the post's feed.
    pub async fn add_comment(
        &self,
        post_id: &str,
        owner: &str,
        body: &str,
    ) -> Result<CommentRecord, GatewayError> {
        let (comment, feed_id) = {
            let mut state = self.inner.write_state();
            let post = state
                .posts
                .iter_mut()
                .find(|post| post.id == post_id)
                .ok_or(GatewayError::NotFound)?;
            post.comment_count += 1;
            let feed_id = post.feed_id.clone();
            let comment = CommentRecord {
                id: format!("comment-{}", Uuid::new_v4()),
                post_id: post_id.to_string(),
                owner: owner.to_string(),
                body: body.to_string(),
                created_at: OffsetDateTime::now_utc(),
            };
            state
                .comments
                .entry(post_id.to_string())
                .or_default()
                .push(comment.clone());
            (comment, feed_id)
        };

        let event = FeedEvent::new(
            post_id,
            FeedEventKind::CommentCreated {
                comment_id: Some(comment.id.clone()),
            },
        );
        self.inner.broadcast(&feed_id, event.to_envelope());
        Ok(comment)
    }

    /// Like a post as `owner`. Liking twice returns the existing like.
    pub async fn create_like(&self, post_id: &str, owner: &str) -> Result<LikeRecord, GatewayError> {
        let (like, announce) = {
            let mut guard = self.inner.write_state();
            let state = &mut *guard;
            let post = state
                .posts
                .iter_mut()
                .find(|post| post.id == post_id)
                .ok_or(GatewayError::NotFound)?;
            let likes = state.likes.entry(post_id.to_string()).or_default();
            match likes.iter().find(|like| like.owner == owner) {
                Some(existing) => (existing.clone(), None),
                None => {
                    let like = LikeRecord {
                        id: format!("like-{}", Uuid::new_v4()),
                        post_id: post_id.to_string(),
                        owner: owner.to_string(),
                        created_at: OffsetDateTime::now_utc(),
                    };
                    likes.push(like.clone());
                    post.like_count += 1;
                    (like, Some((post.feed_id.clone(), post.like_count)))
                }
            }
        };

        if let Some((feed_id, like_count)) = announce {
            self.announce_likes(post_id, &feed_id, like_count);
        }
        Ok(like)
    }

    /// Remove `owner`'s like; returns whether there was one to remove.
    pub async fn delete_like(&self, post_id: &str, owner: &str) -> Result<bool, GatewayError> {
        let announce = {
            let mut guard = self.inner.write_state();
            let state = &mut *guard;
            let post = state
                .posts
                .iter_mut()
                .find(|post| post.id == post_id)
                .ok_or(GatewayError::NotFound)?;
            let likes = state.likes.entry(post_id.to_string()).or_default();
            let before = likes.len();
            likes.retain(|like| like.owner != owner);
            if likes.len() < before {
                post.like_count = post.like_count.saturating_sub(1);
                Some((post.feed_id.clone(), post.like_count))
            } else {
                None
            }
        };

        let removed = announce.is_some();
        if let Some((feed_id, like_count)) = announce {
            self.announce_likes(post_id, &feed_id, like_count);
        }
        Ok(removed)
    }

    fn announce_likes(&self, post_id: &str, feed_id: &str, like_count: u64) {
        let event = FeedEvent::new(
            post_id,
            FeedEventKind::LikeUpdated {
                like_count: Some(like_count),
            },
        );
        self.inner.broadcast(feed_id, event.to_envelope());
    }

    /// Writer acting as `viewer_id`, for client contexts that run in-process.
    pub fn writer_for(&self, viewer_id: impl Into<String>) -> MemoryFeedWriter {
        MemoryFeedWriter {
            backend: self.clone(),
            viewer_id: viewer_id.into(),
        }
    }
}

/// [`FeedWriter`] bound to one viewer of an [`InMemoryBackend`].
pub struct MemoryFeedWriter {
    backend: InMemoryBackend,
    viewer_id: String,
}

#[async_trait]
impl FeedWriter for MemoryFeedWriter {
    async fn add_comment(&self, post_id: &str, body: &str) -> Result<CommentRecord, GatewayError> {
        self.backend.add_comment(post_id, &self.viewer_id, body).await
    }

    async fn create_like(&self, post_id: &str) -> Result<LikeRecord, GatewayError> {
        self.backend.create_like(post_id, &self.viewer_id).await
    }

    async fn delete_like(&self, post_id: &str) -> Result<(), GatewayError> {
        self.backend
            .delete_like(post_id, &self.viewer_id)
            .await
            .map(|_| ())
    }
}

/// Receiver for one feed that gives the feed's channel back once the last
/// subscriber leaves.
struct FeedSubscription {
    inner: Arc<Inner>,
    feed_id: String,
    receiver: broadcast::Receiver<FeedEventEnvelope>,
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        // Our own receiver is still counted here.
        self.inner.prune(&self.feed_id, 1);
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new(MemoryBackendOptions::default())
    }
}

impl Inner {
    fn read_state(&self) -> RwLockReadGuard<'_, MemoryState> {
        recover(self.state.read(), SOURCE, "read_state")
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, MemoryState> {
        recover(self.state.write(), SOURCE, "write_state")
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<FeedEventEnvelope>>> {
        recover(self.channels.lock(), SOURCE, "channels")
    }

    /// Subscribe under the channel lock so a concurrent prune cannot drop
    /// the sender between lookup and subscription.
    fn receiver(&self, feed_id: &str) -> broadcast::Receiver<FeedEventEnvelope> {
        self.channels()
            .entry(feed_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    fn broadcast(&self, feed_id: &str, event: FeedEventEnvelope) -> usize {
        let sender = self.channels().get(feed_id).cloned();
        // Sending with no subscribers is not an error for a fan-out channel.
        let delivered = sender.map_or(0, |sender| sender.send(event).unwrap_or(0));
        if delivered == 0 {
            self.prune(feed_id, 0);
        }
        debug!(feed_id, delivered, "feed event broadcast");
        delivered
    }

    /// Drop the channel of `feed_id` when at most `remaining` receivers are
    /// left on it.
    fn prune(&self, feed_id: &str, remaining: usize) {
        let mut channels = self.channels();
        if channels
            .get(feed_id)
            .is_some_and(|sender| sender.receiver_count() <= remaining)
        {
            channels.remove(feed_id);
            debug!(feed_id, "feed channel released");
        }
    }

    fn decide(&self, caption: &str) -> (ModerationStatus, Option<String>) {
        let lowered = caption.to_lowercase();
        match self
            .options
            .blocked_terms
            .iter()
            .find(|term| lowered.contains(term.as_str()))
        {
            Some(term) => (
                ModerationStatus::Rejected,
                Some(format!("caption contains blocked term `{term}`")),
            ),
            None => (ModerationStatus::Approved, None),
        }
    }

    /// Stand-in for the external state machine: decide, persist, announce.
    async fn moderate(self: Arc<Self>, post_id: String) {
        tokio::time::sleep(self.options.moderation_delay).await;

        let decided = {
            let mut state = self.write_state();
            state
                .posts
                .iter_mut()
                .find(|post| post.id == post_id)
                .map(|post| {
                    let (status, reason) = self.decide(&post.caption);
                    post.moderation_status = status;
                    (post.feed_id.clone(), status, reason)
                })
        };

        let Some((feed_id, status, reason)) = decided else {
            warn!(post_id = %post_id, "post vanished before moderation finished");
            return;
        };
        info!(post_id = %post_id, status = status.as_str(), "moderation decided");
        let event = FeedEvent::new(
            post_id.as_str(),
            FeedEventKind::ModerationUpdated { status, reason },
        );
        self.broadcast(&feed_id, event.to_envelope());
    }
}

#[async_trait]
impl FeedReader for InMemoryBackend {
    async fn list_feed(&self, feed_id: &str) -> Result<Vec<PostRecord>, GatewayError> {
        Ok(self
            .inner
            .read_state()
            .posts
            .iter()
            .filter(|post| post.feed_id == feed_id)
            .cloned()
            .collect())
    }

    async fn list_comments_for_post(
        &self,
        post_id: &str,
    ) -> Result<Vec<CommentRecord>, GatewayError> {
        let state = self.inner.read_state();
        if !state.posts.iter().any(|post| post.id == post_id) {
            return Err(GatewayError::NotFound);
        }
        Ok(state.comments.get(post_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl EventChannel for InMemoryBackend {
    async fn subscribe(&self, feed_id: &str) -> Result<EventStream, GatewayError> {
        let mut subscription = FeedSubscription {
            receiver: self.inner.receiver(feed_id),
            inner: self.inner.clone(),
            feed_id: feed_id.to_string(),
        };
        let events = stream! {
            loop {
                match subscription.receiver.recv().await {
                    Ok(event) => yield Ok::<_, GatewayError>(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            feed_id = %subscription.feed_id,
                            skipped,
                            "subscriber lagged behind feed events"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Ok(events.boxed())
    }
}

#[async_trait]
impl FeedPublisher for InMemoryBackend {
    async fn publish(&self, feed_id: &str, event: FeedEventEnvelope) -> Result<(), GatewayError> {
        self.inner.broadcast(feed_id, event);
        Ok(())
    }
}

#[async_trait]
impl WorkflowStarter for InMemoryBackend {
    async fn start_execution(&self, input: WorkflowExecutionInput) -> Result<String, GatewayError> {
        let post = PostRecord {
            id: input.post_id.clone(),
            caption: input.post.caption,
            photo_url: input.post.photo_url,
            moderation_status: ModerationStatus::Pending,
            like_count: 0,
            comment_count: 0,
            created_at: input.timestamps.created,
            owner: input.viewer_id,
            feed_id: input.post.feed_id,
        };
        self.inner.write_state().posts.insert(0, post);

        tokio::spawn(self.inner.clone().moderate(input.post_id));

        Ok(format!(
            "{}:{}",
            self.inner.options.state_machine, input.request_id
        ))
    }
}
