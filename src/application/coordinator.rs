//! Submission coordinator: drives one "create post" operation end to end.
//!
//! The placeholder is inserted before the workflow trigger is called and is
//! either promoted in place or removed once the call resolves. Each submission
//! only ever touches the placeholder it created. A submission dropped while
//! the trigger is pending removes its placeholder as well.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use feedsync_api_types::SavePostInput;
use metrics::counter;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::domain::error::DomainError;
use crate::domain::posts::{PlaceholderIds, PostId};
use crate::domain::submission::{Submission, ValidatedPost};

use super::feed_store::FeedStore;
use super::lock::recover;
use super::ports::{GatewayError, WorkflowTrigger};

const SOURCE: &str = "application::coordinator";
const METRIC_SUBMISSIONS: &str = "feedsync_submissions_total";
const METRIC_ROLLBACKS: &str = "feedsync_rollbacks_total";

#[derive(Debug, Error)]
pub enum SubmissionError {
    /// Rejected before the feed was touched.
    #[error(transparent)]
    Validation(#[from] DomainError),
    /// The workflow trigger failed; the placeholder has been rolled back.
    #[error("failed to save post: {0}")]
    Trigger(#[from] GatewayError),
}

/// Result of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedPost {
    pub placeholder_id: PostId,
    pub post_id: PostId,
    /// False when the placeholder had already left the feed (for example a
    /// reload replaced it) and there was nothing to promote.
    pub promoted: bool,
}

pub struct SubmissionCoordinator {
    store: Arc<FeedStore>,
    trigger: Arc<dyn WorkflowTrigger>,
    placeholders: Arc<PlaceholderIds>,
    viewer_id: String,
    in_flight: Mutex<HashMap<PostId, Submission>>,
}

impl SubmissionCoordinator {
    pub fn new(
        store: Arc<FeedStore>,
        trigger: Arc<dyn WorkflowTrigger>,
        viewer_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            trigger,
            placeholders: PlaceholderIds::process(),
            viewer_id: viewer_id.into(),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Draw placeholder ids from `placeholders` instead of the process-wide
    /// generator.
    pub fn with_placeholder_ids(mut self, placeholders: Arc<PlaceholderIds>) -> Self {
        self.placeholders = placeholders;
        self
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    /// Number of submissions waiting on the workflow trigger.
    pub fn in_flight(&self) -> usize {
        recover(self.in_flight.lock(), SOURCE, "in_flight").len()
    }

    #[instrument(skip(self, input), fields(feed_id = %input.feed_id_or_global()))]
    pub async fn submit_post(&self, input: SavePostInput) -> Result<SubmittedPost, SubmissionError> {
        let request = match ValidatedPost::parse(&input) {
            Ok(request) => request,
            Err(err) => {
                counter!(METRIC_SUBMISSIONS, "outcome" => "invalid").increment(1);
                debug!(error = %err, "submission rejected by validation");
                return Err(err.into());
            }
        };

        let placeholder_id = self.placeholders.next_id();
        debug!(placeholder_id = %placeholder_id, "inserting placeholder");

        let submission = Submission::new(placeholder_id.clone(), request);
        let workflow_input = submission.request.to_input();
        self.store
            .insert_at_head(submission.placeholder_post(&self.viewer_id));
        let pending = PendingPlaceholder::track(self, submission);

        let result = self.trigger.start_save_post_workflow(workflow_input).await;
        let submission = pending.settle();

        match result {
            Ok(receipt) => {
                let post_id = PostId::from(receipt.post_id);
                let promoted = self.store.replace_id(&placeholder_id, post_id.clone());
                counter!(METRIC_SUBMISSIONS, "outcome" => "accepted").increment(1);
                info!(
                    placeholder_id = %placeholder_id,
                    post_id = %post_id,
                    promoted,
                    elapsed_ms = submission
                        .map(|s| (time::OffsetDateTime::now_utc() - s.started_at).whole_milliseconds() as i64)
                        .unwrap_or_default(),
                    "post submission accepted"
                );
                Ok(SubmittedPost {
                    placeholder_id,
                    post_id,
                    promoted,
                })
            }
            Err(err) => {
                let removed = self.store.remove(&placeholder_id);
                counter!(METRIC_SUBMISSIONS, "outcome" => "failed").increment(1);
                counter!(METRIC_ROLLBACKS).increment(1);
                warn!(
                    placeholder_id = %placeholder_id,
                    error = %err,
                    removed,
                    "post submission failed; placeholder rolled back"
                );
                Err(err.into())
            }
        }
    }
}

/// Owns a placeholder while the trigger call is pending. Dropping it before
/// [`PendingPlaceholder::settle`] untracks the submission and removes exactly
/// its placeholder.
struct PendingPlaceholder<'a> {
    coordinator: &'a SubmissionCoordinator,
    placeholder_id: PostId,
    settled: bool,
}

impl<'a> PendingPlaceholder<'a> {
    fn track(coordinator: &'a SubmissionCoordinator, submission: Submission) -> Self {
        let placeholder_id = submission.placeholder_id.clone();
        recover(coordinator.in_flight.lock(), SOURCE, "track")
            .insert(placeholder_id.clone(), submission);
        Self {
            coordinator,
            placeholder_id,
            settled: false,
        }
    }

    /// The trigger resolved; the caller promotes or rolls back.
    fn settle(mut self) -> Option<Submission> {
        self.settled = true;
        recover(self.coordinator.in_flight.lock(), SOURCE, "untrack").remove(&self.placeholder_id)
    }
}

impl Drop for PendingPlaceholder<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        recover(self.coordinator.in_flight.lock(), SOURCE, "cancel").remove(&self.placeholder_id);
        let removed = self.coordinator.store.remove(&self.placeholder_id);
        counter!(METRIC_SUBMISSIONS, "outcome" => "cancelled").increment(1);
        counter!(METRIC_ROLLBACKS).increment(1);
        warn!(
            placeholder_id = %self.placeholder_id,
            removed,
            "post submission dropped before the trigger resolved; placeholder rolled back"
        );
    }
}
