//! The feed store: sole mutator of the locally visible feed.
//!
//! Every mutation takes the state lock for the duration of one named operation
//! and never across an `.await`, so each operation is atomic relative to the
//! others. By-id operations that find nothing are no-ops and report `false`:
//! promotion and event application may race with a reload that already
//! replaced the feed, and the next reload corrects any drift.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use feedsync_api_types::{CommentRecord, LikeRecord, ModerationStatus};
use tokio::sync::watch;
use tracing::{debug, instrument};

use crate::domain::posts::{Post, PostId};

use super::lock::recover;
use super::ports::{FeedReader, GatewayError};

const SOURCE: &str = "application::feed_store";

#[derive(Debug, Default)]
struct FeedState {
    posts: Vec<Post>,
    comments: HashMap<PostId, Vec<CommentRecord>>,
    /// Likes held by this context's viewer, keyed by post.
    likes: HashMap<PostId, LikeRecord>,
}

pub struct FeedStore {
    reader: Arc<dyn FeedReader>,
    state: RwLock<FeedState>,
    revision: watch::Sender<u64>,
}

impl FeedStore {
    pub fn new(reader: Arc<dyn FeedReader>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            reader,
            state: RwLock::new(FeedState::default()),
            revision,
        }
    }

    /// Receiver that observes a new revision number after every mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    fn read(&self, op: &'static str) -> RwLockReadGuard<'_, FeedState> {
        recover(self.state.read(), SOURCE, op)
    }

    fn write(&self, op: &'static str) -> RwLockWriteGuard<'_, FeedState> {
        recover(self.state.write(), SOURCE, op)
    }

    /// Copy of the feed, newest first.
    pub fn snapshot(&self) -> Vec<Post> {
        self.read("snapshot").posts.clone()
    }

    pub fn get(&self, id: &PostId) -> Option<Post> {
        self.read("get")
            .posts
            .iter()
            .find(|post| &post.id == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.read("len").posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of posts still awaiting a moderation decision.
    pub fn pending_moderation(&self) -> usize {
        self.read("pending_moderation")
            .posts
            .iter()
            .filter(|post| post.is_pending())
            .count()
    }

    pub fn comments(&self, post_id: &PostId) -> Vec<CommentRecord> {
        self.read("comments")
            .comments
            .get(post_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether the viewer currently likes `post_id`.
    pub fn is_liked(&self, post_id: &PostId) -> bool {
        self.read("is_liked").likes.contains_key(post_id)
    }

    /// Prepend a post. Callers guarantee the id is not already present.
    pub fn insert_at_head(&self, post: Post) {
        self.write("insert_at_head")
            .posts
            .insert(0, post);
        self.bump();
    }

    /// Give the first post with `old_id` the id `new_id`, leaving its position
    /// and every other field untouched.
    pub fn replace_id(&self, old_id: &PostId, new_id: PostId) -> bool {
        let replaced = {
            let mut state = self.write("replace_id");
            match state.posts.iter_mut().find(|post| &post.id == old_id) {
                Some(post) => {
                    post.id = new_id.clone();
                    true
                }
                None => false,
            }
        };

        if replaced {
            self.bump();
        } else {
            debug!(old_id = %old_id, new_id = %new_id, "replace_id found no matching post");
        }
        replaced
    }

    /// Remove every post matching `predicate`; returns how many were removed.
    pub fn remove_where(&self, predicate: impl Fn(&Post) -> bool) -> usize {
        let removed = {
            let mut state = self.write("remove_where");
            let before = state.posts.len();
            state.posts.retain(|post| !predicate(post));
            before - state.posts.len()
        };

        if removed > 0 {
            self.bump();
        }
        removed
    }

    /// Remove exactly the post with `id`.
    pub fn remove(&self, id: &PostId) -> bool {
        self.remove_where(|post| &post.id == id) > 0
    }

    /// Set the moderation status of `post_id`. Applying the same status again
    /// leaves the feed unchanged.
    pub fn apply_moderation_update(&self, post_id: &PostId, status: ModerationStatus) -> bool {
        let (found, changed) = {
            let mut state = self.write("apply_moderation_update");
            match state.posts.iter_mut().find(|post| &post.id == post_id) {
                Some(post) => {
                    let changed = post.moderation_status != status;
                    post.moderation_status = status;
                    (true, changed)
                }
                None => (false, false),
            }
        };

        if changed {
            self.bump();
        }
        if !found {
            debug!(post_id = %post_id, status = status.as_str(), "moderation update for absent post");
        }
        found
    }

    /// Append a comment the viewer just created and count it on its post.
    ///
    /// Returns `false` when the comment is already known, which happens when
    /// the COMMENT_CREATED refetch landed first.
    pub fn append_comment(&self, comment: CommentRecord) -> bool {
        let post_id = PostId::from(comment.post_id.as_str());
        let appended = {
            let mut state = self.write("append_comment");
            let comments = state.comments.entry(post_id.clone()).or_default();
            if comments.iter().any(|known| known.id == comment.id) {
                false
            } else {
                comments.push(comment);
                if let Some(post) = state.posts.iter_mut().find(|post| post.id == post_id) {
                    post.comment_count += 1;
                }
                true
            }
        };

        if appended {
            self.bump();
        } else {
            debug!(post_id = %post_id, "comment already present");
        }
        appended
    }

    /// Remember the viewer's like and count it. A second like on the same post
    /// changes nothing.
    pub fn record_like(&self, like: LikeRecord) -> bool {
        let post_id = PostId::from(like.post_id.as_str());
        let recorded = {
            let mut state = self.write("record_like");
            if state.likes.contains_key(&post_id) {
                false
            } else {
                state.likes.insert(post_id.clone(), like);
                if let Some(post) = state.posts.iter_mut().find(|post| post.id == post_id) {
                    post.like_count += 1;
                }
                true
            }
        };

        if recorded {
            self.bump();
        }
        recorded
    }

    /// Drop the viewer's like on `post_id`. The like count never goes below 0.
    pub fn forget_like(&self, post_id: &PostId) -> bool {
        let forgotten = {
            let mut state = self.write("forget_like");
            let removed = state.likes.remove(post_id).is_some();
            if removed && let Some(post) = state.posts.iter_mut().find(|post| &post.id == post_id) {
                post.like_count = post.like_count.saturating_sub(1);
            }
            removed
        };

        if forgotten {
            self.bump();
        }
        forgotten
    }

    /// Replace the whole feed with the authoritative list for `feed_id`.
    #[instrument(skip(self))]
    pub async fn reload(&self, feed_id: &str) -> Result<usize, GatewayError> {
        let records = self.reader.list_feed(feed_id).await?;
        let posts: Vec<Post> = records.into_iter().map(Post::from).collect();
        let count = posts.len();

        {
            let mut state = self.write("reload");
            state
                .comments
                .retain(|post_id, _| posts.iter().any(|post| &post.id == post_id));
            state.posts = posts;
        }
        self.bump();

        debug!(feed_id, count, "feed reloaded");
        Ok(count)
    }

    /// Refetch the comments of one post and align its comment count.
    #[instrument(skip(self, post_id), fields(post_id = %post_id))]
    pub async fn reload_comments(&self, post_id: &PostId) -> Result<usize, GatewayError> {
        let comments = self.reader.list_comments_for_post(post_id.as_str()).await?;
        let count = comments.len();

        {
            let mut state = self.write("reload_comments");
            if let Some(post) = state.posts.iter_mut().find(|post| &post.id == post_id) {
                post.comment_count = count as u64;
            }
            state.comments.insert(post_id.clone(), comments);
        }
        self.bump();

        Ok(count)
    }

    /// Drop all local state.
    pub fn clear(&self) {
        {
            let mut state = self.write("clear");
            state.posts.clear();
            state.comments.clear();
            state.likes.clear();
        }
        self.bump();
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use async_trait::async_trait;
    use feedsync_api_types::PostRecord;
    use time::OffsetDateTime;

    use super::*;

    #[derive(Default)]
    struct FixedReader {
        posts: Vec<PostRecord>,
        comments: Vec<CommentRecord>,
        fail: bool,
    }

    #[async_trait]
    impl FeedReader for FixedReader {
        async fn list_feed(&self, _feed_id: &str) -> Result<Vec<PostRecord>, GatewayError> {
            if self.fail {
                return Err(GatewayError::network("connection refused"));
            }
            Ok(self.posts.clone())
        }

        async fn list_comments_for_post(
            &self,
            post_id: &str,
        ) -> Result<Vec<CommentRecord>, GatewayError> {
            Ok(self
                .comments
                .iter()
                .filter(|comment| comment.post_id == post_id)
                .cloned()
                .collect())
        }
    }

    fn record(id: &str, status: ModerationStatus) -> PostRecord {
        PostRecord {
            id: id.to_string(),
            caption: format!("caption {id}"),
            photo_url: format!("https://cdn.example/{id}.jpg"),
            moderation_status: status,
            like_count: 0,
            comment_count: 0,
            created_at: OffsetDateTime::UNIX_EPOCH,
            owner: "user-1".to_string(),
            feed_id: "GLOBAL".to_string(),
        }
    }

    fn post(id: &str) -> Post {
        Post::from(record(id, ModerationStatus::Pending))
    }

    fn ids(store: &FeedStore) -> Vec<String> {
        store
            .snapshot()
            .into_iter()
            .map(|post| post.id.into_inner())
            .collect()
    }

    fn empty_store() -> FeedStore {
        FeedStore::new(Arc::new(FixedReader::default()))
    }

    #[test]
    fn insert_at_head_prepends() {
        let store = empty_store();
        store.insert_at_head(post("a"));
        store.insert_at_head(post("b"));

        assert_eq!(ids(&store), vec!["b", "a"]);
        assert_eq!(store.revision(), 2);
    }

    #[test]
    fn replace_id_keeps_position_and_fields() {
        let store = empty_store();
        store.insert_at_head(post("a"));
        store.insert_at_head(post("temp-1"));
        store.insert_at_head(post("c"));
        let before = store.get(&PostId::from("temp-1")).expect("placeholder present");

        assert!(store.replace_id(&PostId::from("temp-1"), PostId::from("post-9")));

        assert_eq!(ids(&store), vec!["c", "post-9", "a"]);
        let after = store.get(&PostId::from("post-9")).expect("promoted post");
        assert_eq!(after.caption, before.caption);
        assert_eq!(after.created_at, before.created_at);
    }

    #[test]
    fn by_id_operations_on_absent_posts_are_no_ops() {
        let store = empty_store();
        store.insert_at_head(post("a"));
        let before = store.snapshot();
        let revision = store.revision();

        assert!(!store.replace_id(&PostId::from("missing"), PostId::from("x")));
        assert!(!store.apply_moderation_update(&PostId::from("missing"), ModerationStatus::Approved));
        assert!(!store.remove(&PostId::from("missing")));

        assert_eq!(store.snapshot(), before);
        assert_eq!(store.revision(), revision);
    }

    #[test]
    fn moderation_update_is_idempotent() {
        let store = empty_store();
        store.insert_at_head(post("a"));

        assert!(store.apply_moderation_update(&PostId::from("a"), ModerationStatus::Approved));
        let once = store.snapshot();
        let revision = store.revision();

        assert!(store.apply_moderation_update(&PostId::from("a"), ModerationStatus::Approved));
        assert_eq!(store.snapshot(), once);
        assert_eq!(store.revision(), revision);
        assert_eq!(store.pending_moderation(), 0);
    }

    #[test]
    fn remove_where_counts_removed_posts() {
        let store = empty_store();
        store.insert_at_head(post("temp-1"));
        store.insert_at_head(post("a"));
        store.insert_at_head(post("temp-2"));

        assert_eq!(store.remove_where(Post::is_placeholder), 2);
        assert_eq!(ids(&store), vec!["a"]);
        assert_eq!(store.remove_where(Post::is_placeholder), 0);
    }

    #[tokio::test]
    async fn reload_replaces_contents_wholesale() {
        let reader = FixedReader {
            posts: vec![
                record("p2", ModerationStatus::Pending),
                record("p1", ModerationStatus::Approved),
            ],
            ..Default::default()
        };
        let store = FeedStore::new(Arc::new(reader));
        store.insert_at_head(post("temp-1"));

        let count = store.reload("GLOBAL").await.expect("reload succeeds");

        assert_eq!(count, 2);
        assert_eq!(ids(&store), vec!["p2", "p1"]);
        assert_eq!(store.pending_moderation(), 1);
    }

    #[tokio::test]
    async fn failed_reload_leaves_feed_untouched() {
        let reader = FixedReader {
            fail: true,
            ..Default::default()
        };
        let store = FeedStore::new(Arc::new(reader));
        store.insert_at_head(post("a"));

        assert!(store.reload("GLOBAL").await.is_err());
        assert_eq!(ids(&store), vec!["a"]);
    }

    #[tokio::test]
    async fn reload_comments_updates_comment_count() {
        let reader = FixedReader {
            posts: vec![record("p1", ModerationStatus::Approved)],
            comments: vec![
                CommentRecord {
                    id: "c1".to_string(),
                    post_id: "p1".to_string(),
                    owner: "user-2".to_string(),
                    body: "nice".to_string(),
                    created_at: OffsetDateTime::UNIX_EPOCH,
                },
                CommentRecord {
                    id: "c2".to_string(),
                    post_id: "other".to_string(),
                    owner: "user-2".to_string(),
                    body: "elsewhere".to_string(),
                    created_at: OffsetDateTime::UNIX_EPOCH,
                },
            ],
            ..Default::default()
        };
        let store = FeedStore::new(Arc::new(reader));
        store.reload("GLOBAL").await.expect("reload succeeds");

        let id = PostId::from("p1");
        assert_eq!(store.reload_comments(&id).await.expect("comments"), 1);
        assert_eq!(store.comments(&id).len(), 1);
        assert_eq!(store.get(&id).expect("post").comment_count, 1);
    }

    #[tokio::test]
    async fn subscribers_observe_mutations() {
        let store = empty_store();
        let mut revisions = store.subscribe();

        store.insert_at_head(post("a"));
        revisions.changed().await.expect("store alive");
        assert_eq!(*revisions.borrow_and_update(), 1);

        store.clear();
        revisions.changed().await.expect("store alive");
        assert!(store.is_empty());
    }

    fn comment(id: &str, post_id: &str) -> CommentRecord {
        CommentRecord {
            id: id.to_string(),
            post_id: post_id.to_string(),
            owner: "user-2".to_string(),
            body: "nice".to_string(),
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn like(post_id: &str) -> LikeRecord {
        LikeRecord {
            id: format!("like-{post_id}"),
            post_id: post_id.to_string(),
            owner: "user-1".to_string(),
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn append_comment_counts_each_comment_once() {
        let store = empty_store();
        store.insert_at_head(post("a"));
        let id = PostId::from("a");

        assert!(store.append_comment(comment("c1", "a")));
        assert!(!store.append_comment(comment("c1", "a")));

        assert_eq!(store.comments(&id), vec![comment("c1", "a")]);
        assert_eq!(store.get(&id).expect("post").comment_count, 1);
    }

    #[tokio::test]
    async fn appended_comment_converges_with_refetch() {
        let reader = FixedReader {
            posts: vec![record("p1", ModerationStatus::Approved)],
            comments: vec![comment("c1", "p1")],
            ..Default::default()
        };
        let store = FeedStore::new(Arc::new(reader));
        store.reload("GLOBAL").await.expect("reload succeeds");
        let id = PostId::from("p1");

        store.reload_comments(&id).await.expect("comments");
        assert!(!store.append_comment(comment("c1", "p1")));

        assert_eq!(store.get(&id).expect("post").comment_count, 1);
    }

    #[test]
    fn likes_toggle_count_and_never_go_negative() {
        let store = empty_store();
        store.insert_at_head(post("a"));
        let id = PostId::from("a");

        assert!(store.record_like(like("a")));
        assert!(!store.record_like(like("a")));
        assert!(store.is_liked(&id));
        assert_eq!(store.get(&id).expect("post").like_count, 1);

        assert!(store.forget_like(&id));
        assert!(!store.forget_like(&id));
        assert!(!store.is_liked(&id));
        assert_eq!(store.get(&id).expect("post").like_count, 0);

        // The feed may report zero likes while the viewer still holds one.
        store.record_like(like("a"));
        store.write("test").posts[0].like_count = 0;
        assert!(store.forget_like(&id));
        assert_eq!(store.get(&id).expect("post").like_count, 0);
    }

    #[test]
    fn clear_forgets_likes() {
        let store = empty_store();
        store.insert_at_head(post("a"));
        store.record_like(like("a"));

        store.clear();

        assert!(!store.is_liked(&PostId::from("a")));
    }

    #[test]
    fn store_recovers_from_poisoned_lock() {
        let store = empty_store();

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store.state.write().expect("state lock should be acquired");
            panic!("poison feed lock");
        }));

        store.insert_at_head(post("a"));
        assert_eq!(store.len(), 1);
    }
}
