//! Backend glue that turns a save-post request into a workflow execution.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use feedsync_api_types::{SavePostInput, SavePostReceipt, SubmissionStatus};
use metrics::counter;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, instrument, warn};

use crate::domain::error::DomainError;
use crate::domain::events::{FeedEvent, FeedEventKind};
use crate::domain::submission::ValidatedPost;

use super::ports::{
    FeedPublisher, GatewayError, WorkflowExecutionInput, WorkflowPost, WorkflowStarter,
    WorkflowTimestamps, WorkflowTrigger,
};

const METRIC_EXECUTIONS: &str = "feedsync_workflow_executions_total";

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error("failed to start save-post workflow: {0}")]
    Start(#[source] GatewayError),
}

/// Allocates `post-<unix millis>` ids that strictly increase even when two
/// requests land in the same millisecond.
#[derive(Debug, Default)]
pub struct PostIdAllocator {
    last: AtomicU64,
}

impl PostIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_millis(&self) -> u64 {
        let now = unix_millis(OffsetDateTime::now_utc());
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(previous + 1)
    }
}

fn unix_millis(at: OffsetDateTime) -> u64 {
    u64::try_from(at.unix_timestamp_nanos() / 1_000_000).unwrap_or_default()
}

pub struct SavePostWorkflow {
    starter: Arc<dyn WorkflowStarter>,
    publisher: Arc<dyn FeedPublisher>,
    ids: PostIdAllocator,
}

impl SavePostWorkflow {
    pub fn new(starter: Arc<dyn WorkflowStarter>, publisher: Arc<dyn FeedPublisher>) -> Self {
        Self {
            starter,
            publisher,
            ids: PostIdAllocator::new(),
        }
    }

    /// Validate the request, start the moderation workflow, announce the post
    /// on its feed and answer with the queued receipt.
    #[instrument(skip(self, input), fields(feed_id = %input.feed_id_or_global()))]
    pub async fn save_post(
        &self,
        viewer_id: &str,
        input: SavePostInput,
    ) -> Result<SavePostReceipt, WorkflowError> {
        let post = ValidatedPost::parse(&input)?;
        let millis = self.ids.next_millis();
        let post_id = format!("post-{millis}");
        let now = OffsetDateTime::now_utc();

        let execution = WorkflowExecutionInput {
            request_id: format!("save-post-{millis}"),
            viewer_id: viewer_id.to_string(),
            post_id: post_id.clone(),
            post: WorkflowPost {
                caption: post.caption,
                photo_storage_key: post.photo_storage_key,
                photo_url: post.photo_url,
                feed_id: post.feed_id.clone(),
            },
            timestamps: WorkflowTimestamps {
                created: now,
                updated: now,
            },
        };

        let execution_id = self
            .starter
            .start_execution(execution)
            .await
            .map_err(WorkflowError::Start)?;
        counter!(METRIC_EXECUTIONS).increment(1);
        info!(post_id = %post_id, execution_id = %execution_id, "save-post workflow started");

        let created = FeedEvent::new(post_id.as_str(), FeedEventKind::PostCreated);
        if let Err(err) = self
            .publisher
            .publish(&post.feed_id, created.to_envelope())
            .await
        {
            // The workflow already owns the post; subscribers resync on the next reload.
            warn!(post_id = %post_id, error = %err, "failed to publish POST_CREATED");
        }

        Ok(SavePostReceipt {
            post_id,
            status: SubmissionStatus::Queued,
            submitted_at: OffsetDateTime::now_utc(),
        })
    }
}

/// [`WorkflowTrigger`] that calls the save-post glue in process, acting as
/// one fixed viewer.
pub struct LocalWorkflowTrigger {
    workflow: Arc<SavePostWorkflow>,
    viewer_id: String,
}

impl LocalWorkflowTrigger {
    pub fn new(workflow: Arc<SavePostWorkflow>, viewer_id: impl Into<String>) -> Self {
        Self {
            workflow,
            viewer_id: viewer_id.into(),
        }
    }
}

#[async_trait]
impl WorkflowTrigger for LocalWorkflowTrigger {
    async fn start_save_post_workflow(
        &self,
        input: SavePostInput,
    ) -> Result<SavePostReceipt, GatewayError> {
        self.workflow
            .save_post(&self.viewer_id, input)
            .await
            .map_err(|err| match err {
                WorkflowError::Validation(err) => GatewayError::rejected(400, err.to_string()),
                WorkflowError::Start(err) => err,
            })
    }
}
