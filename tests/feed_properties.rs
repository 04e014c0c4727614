use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use feedsync::application::coordinator::{SubmissionCoordinator, SubmissionError};
use feedsync::application::feed_store::FeedStore;
use feedsync::application::listener::{EventListener, ListenerOptions};
use feedsync::application::ports::{
    EventChannel, EventStream, FeedReader, GatewayError, WorkflowTrigger,
};
use feedsync::domain::posts::{PlaceholderIds, Post, PostId};
use feedsync_api_types::{
    CommentRecord, FeedEventEnvelope, ModerationStatus, PostRecord, SavePostInput,
    SavePostReceipt, SubmissionStatus,
};
use futures::StreamExt;
use serde_json::json;
use time::OffsetDateTime;

/// Authoritative feed the store reloads from.
#[derive(Default)]
struct FixedFeed {
    posts: Mutex<Vec<PostRecord>>,
}

#[async_trait]
impl FeedReader for FixedFeed {
    async fn list_feed(&self, _feed_id: &str) -> Result<Vec<PostRecord>, GatewayError> {
        Ok(self.posts.lock().expect("posts").clone())
    }

    async fn list_comments_for_post(
        &self,
        _post_id: &str,
    ) -> Result<Vec<CommentRecord>, GatewayError> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl EventChannel for FixedFeed {
    async fn subscribe(&self, _feed_id: &str) -> Result<EventStream, GatewayError> {
        Ok(futures::stream::pending().boxed())
    }
}

/// Trigger answering from a queue and recording the feed it saw mid-call.
struct QueuedTrigger {
    store: Arc<FeedStore>,
    answers: Mutex<VecDeque<Result<String, GatewayError>>>,
    seen: Mutex<Vec<Vec<Post>>>,
}

impl QueuedTrigger {
    fn new(store: Arc<FeedStore>, answers: Vec<Result<String, GatewayError>>) -> Self {
        Self {
            store,
            answers: Mutex::new(answers.into()),
            seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl WorkflowTrigger for QueuedTrigger {
    async fn start_save_post_workflow(
        &self,
        _input: SavePostInput,
    ) -> Result<SavePostReceipt, GatewayError> {
        self.seen.lock().expect("seen").push(self.store.snapshot());
        let answer = self
            .answers
            .lock()
            .expect("answers")
            .pop_front()
            .unwrap_or(Err(GatewayError::Throttled));
        answer.map(|post_id| SavePostReceipt {
            post_id,
            status: SubmissionStatus::Queued,
            submitted_at: OffsetDateTime::now_utc(),
        })
    }
}

fn record(id: &str) -> PostRecord {
    PostRecord {
        id: id.to_string(),
        caption: format!("caption {id}"),
        photo_url: format!("https://cdn.test/{id}.jpg"),
        moderation_status: ModerationStatus::Approved,
        like_count: 0,
        comment_count: 0,
        created_at: OffsetDateTime::now_utc(),
        owner: "bob".to_string(),
        feed_id: "GLOBAL".to_string(),
    }
}

fn request(caption: &str) -> SavePostInput {
    SavePostInput {
        caption: caption.to_string(),
        photo_storage_key: "k".to_string(),
        photo_url: "u".to_string(),
        feed_id: None,
    }
}

async fn store_with(existing: &[&str]) -> (Arc<FixedFeed>, Arc<FeedStore>) {
    let feed = Arc::new(FixedFeed::default());
    *feed.posts.lock().expect("posts") = existing.iter().map(|id| record(id)).collect();
    let store = Arc::new(FeedStore::new(feed.clone()));
    store.reload("GLOBAL").await.expect("reload");
    (feed, store)
}

fn ids(posts: &[Post]) -> Vec<String> {
    posts.iter().map(|post| post.id.to_string()).collect()
}

#[tokio::test]
async fn submission_walks_from_placeholder_to_approved() {
    let (feed, store) = store_with(&[]).await;
    let trigger = Arc::new(QueuedTrigger::new(store.clone(), vec![Ok("post-42".into())]));
    let coordinator = SubmissionCoordinator::new(store.clone(), trigger.clone(), "viewer")
        .with_placeholder_ids(Arc::new(PlaceholderIds::new()));
    let listener = EventListener::new(store.clone(), feed, ListenerOptions::default());
    listener.connect("GLOBAL").await.expect("connect");

    let submitted = coordinator.submit_post(request("hi")).await.expect("accepted");

    let seen = trigger.seen.lock().expect("seen").clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(ids(&seen[0]), vec!["temp-1"]);
    assert_eq!(seen[0][0].caption, "hi");
    assert_eq!(seen[0][0].moderation_status, ModerationStatus::Pending);

    assert_eq!(submitted.placeholder_id, PostId::from("temp-1"));
    assert_eq!(submitted.post_id, PostId::from("post-42"));
    let promoted = store.snapshot();
    assert_eq!(ids(&promoted), vec!["post-42"]);
    assert_eq!(promoted[0].caption, "hi");
    assert_eq!(promoted[0].moderation_status, ModerationStatus::Pending);

    let event: FeedEventEnvelope = serde_json::from_value(json!({
        "type": "MODERATION_UPDATED",
        "postId": "post-42",
        "payload": { "status": "APPROVED" },
        "createdAt": "2024-05-01T12:00:00Z"
    }))
    .expect("envelope");
    listener.handle_event(event).await.expect("applied");

    let approved = store.snapshot();
    assert_eq!(ids(&approved), vec!["post-42"]);
    assert_eq!(approved[0].moderation_status, ModerationStatus::Approved);
}

#[tokio::test]
async fn promotion_keeps_head_position_and_fields() {
    let (_feed, store) = store_with(&["post-2", "post-1"]).await;
    let trigger = Arc::new(QueuedTrigger::new(store.clone(), vec![Ok("post-3".into())]));
    let coordinator = SubmissionCoordinator::new(store.clone(), trigger.clone(), "viewer");

    coordinator
        .submit_post(SavePostInput {
            caption: "morning".to_string(),
            photo_storage_key: "uploads/m.jpg".to_string(),
            photo_url: "https://cdn.test/m.jpg".to_string(),
            feed_id: None,
        })
        .await
        .expect("accepted");

    let posts = store.snapshot();
    assert_eq!(ids(&posts), vec!["post-3", "post-2", "post-1"]);
    assert_eq!(posts[0].caption, "morning");
    assert_eq!(posts[0].photo_url, "https://cdn.test/m.jpg");
}

#[tokio::test]
async fn failed_trigger_restores_exact_feed() {
    let (_feed, store) = store_with(&["post-2", "post-1"]).await;
    let before = store.snapshot();
    let trigger = Arc::new(QueuedTrigger::new(
        store.clone(),
        vec![Err(GatewayError::rejected(422, "no"))],
    ));
    let coordinator = SubmissionCoordinator::new(store.clone(), trigger.clone(), "viewer");

    let err = coordinator
        .submit_post(request("doomed"))
        .await
        .expect_err("trigger fails");

    assert!(matches!(
        err,
        SubmissionError::Trigger(GatewayError::Rejected { status: 422, .. })
    ));
    assert_eq!(trigger.seen.lock().expect("seen")[0].len(), 3);
    assert_eq!(store.snapshot(), before);
}

#[tokio::test]
async fn repeated_moderation_update_is_idempotent() {
    let (_feed, store) = store_with(&["post-1"]).await;
    let id = PostId::from("post-1");
    assert!(store.apply_moderation_update(&id, ModerationStatus::Rejected));

    assert!(store.apply_moderation_update(&id, ModerationStatus::Approved));
    let once = store.snapshot();
    let revision = store.revision();
    assert!(store.apply_moderation_update(&id, ModerationStatus::Approved));

    assert_eq!(store.snapshot(), once);
    assert_eq!(store.revision(), revision);
}

#[tokio::test]
async fn operations_on_absent_ids_change_nothing() {
    let (_feed, store) = store_with(&["post-2", "post-1"]).await;
    let before = store.snapshot();
    let missing = PostId::from("post-404");

    assert!(!store.apply_moderation_update(&missing, ModerationStatus::Approved));
    assert!(!store.replace_id(&missing, PostId::from("post-405")));
    assert!(!store.remove(&missing));

    assert_eq!(store.snapshot(), before);
}
