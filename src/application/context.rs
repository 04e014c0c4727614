//! Explicitly owned feed context: store, coordinator and listener with a
//! `new` / `dispose` lifecycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use feedsync_api_types::{ANONYMOUS_VIEWER, CommentRecord, SavePostInput};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::domain::error::DomainError;
use crate::domain::posts::{PostId, comment_body};

use super::coordinator::{SubmissionCoordinator, SubmissionError, SubmittedPost};
use super::feed_store::FeedStore;
use super::listener::{EventListener, ListenerError, ListenerOptions};
use super::ports::{EventChannel, FeedReader, FeedWriter, GatewayError, WorkflowTrigger};

/// The collaborators a client-side context talks to.
#[derive(Clone)]
pub struct Backend {
    pub trigger: Arc<dyn WorkflowTrigger>,
    pub reader: Arc<dyn FeedReader>,
    pub writer: Arc<dyn FeedWriter>,
    pub events: Arc<dyn EventChannel>,
}

impl Backend {
    pub fn new(
        trigger: Arc<dyn WorkflowTrigger>,
        reader: Arc<dyn FeedReader>,
        writer: Arc<dyn FeedWriter>,
        events: Arc<dyn EventChannel>,
    ) -> Self {
        Self {
            trigger,
            reader,
            writer,
            events,
        }
    }

    /// Use one adapter for every role.
    pub fn from_shared<T>(backend: Arc<T>) -> Self
    where
        T: WorkflowTrigger + FeedReader + FeedWriter + EventChannel + 'static,
    {
        Self {
            trigger: backend.clone(),
            reader: backend.clone(),
            writer: backend.clone(),
            events: backend,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub viewer_id: String,
    pub listener: ListenerOptions,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            viewer_id: ANONYMOUS_VIEWER.to_string(),
            listener: ListenerOptions::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("feed context has been disposed")]
    Disposed,
    #[error("failed to load feed `{feed_id}`: {source}")]
    Load {
        feed_id: String,
        #[source]
        source: GatewayError,
    },
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error(transparent)]
    Submission(#[from] SubmissionError),
    #[error(transparent)]
    Invalid(#[from] DomainError),
    #[error("failed to update post `{post_id}`: {source}")]
    Write {
        post_id: PostId,
        #[source]
        source: GatewayError,
    },
}

pub struct FeedContext {
    store: Arc<FeedStore>,
    writer: Arc<dyn FeedWriter>,
    coordinator: SubmissionCoordinator,
    listener: EventListener,
    disposed: AtomicBool,
}

impl FeedContext {
    pub fn new(backend: Backend, options: ContextOptions) -> Self {
        let store = Arc::new(FeedStore::new(backend.reader));
        let coordinator =
            SubmissionCoordinator::new(store.clone(), backend.trigger, options.viewer_id);
        let listener = EventListener::new(store.clone(), backend.events, options.listener);
        Self {
            store,
            writer: backend.writer,
            coordinator,
            listener,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<FeedStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &SubmissionCoordinator {
        &self.coordinator
    }

    pub fn listener(&self) -> &EventListener {
        &self.listener
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> Result<(), ContextError> {
        if self.is_disposed() {
            Err(ContextError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Load `feed_id` and start listening for its events.
    #[instrument(skip(self))]
    pub async fn initialize(&self, feed_id: &str) -> Result<usize, ContextError> {
        self.ensure_live()?;
        let count = self
            .store
            .reload(feed_id)
            .await
            .map_err(|source| ContextError::Load {
                feed_id: feed_id.to_string(),
                source,
            })?;
        self.listener.connect(feed_id).await?;
        info!(count, "feed context initialized");
        Ok(count)
    }

    pub async fn submit_post(&self, input: SavePostInput) -> Result<SubmittedPost, ContextError> {
        self.ensure_live()?;
        Ok(self.coordinator.submit_post(input).await?)
    }

    /// Comment on a post and show the comment locally once the backend stored
    /// it.
    #[instrument(skip(self, body), fields(post_id = %post_id))]
    pub async fn add_comment(
        &self,
        post_id: &PostId,
        body: &str,
    ) -> Result<CommentRecord, ContextError> {
        self.ensure_live()?;
        let body = comment_body(body)?;
        let comment = self
            .writer
            .add_comment(post_id.as_str(), body)
            .await
            .map_err(|source| ContextError::Write {
                post_id: post_id.clone(),
                source,
            })?;
        self.store.append_comment(comment.clone());
        debug!(comment_id = %comment.id, "comment added");
        Ok(comment)
    }

    /// Like the post, or unlike it when the viewer already likes it. Returns
    /// whether the viewer likes the post afterwards.
    #[instrument(skip(self), fields(post_id = %post_id))]
    pub async fn toggle_like(&self, post_id: &PostId) -> Result<bool, ContextError> {
        self.ensure_live()?;
        let write_error = |source| ContextError::Write {
            post_id: post_id.clone(),
            source,
        };

        if self.store.is_liked(post_id) {
            self.writer
                .delete_like(post_id.as_str())
                .await
                .map_err(write_error)?;
            self.store.forget_like(post_id);
            debug!("post unliked");
            Ok(false)
        } else {
            let like = self
                .writer
                .create_like(post_id.as_str())
                .await
                .map_err(write_error)?;
            self.store.record_like(like);
            debug!("post liked");
            Ok(true)
        }
    }

    /// Disconnect the listener and drop local state. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.listener.disconnect();
        self.store.clear();
        info!("feed context disposed");
    }
}
