//! reqwest adapter implementing the client-side ports against the HTTP
//! transport served by `feedsync serve`.

use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use feedsync_api_types::{
    ApiErrorBody, CommentRecord, CreateCommentRequest, FeedEventEnvelope, ItemsResponse,
    LikeRecord, PostRecord, SavePostInput, SavePostReceipt, VIEWER_HEADER,
};
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::application::ports::{
    EventChannel, EventStream, FeedReader, FeedWriter, GatewayError, WorkflowTrigger,
};
use crate::config::BackendSettings;

use super::error::InfraError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct HttpBackend {
    client: Client,
    base: Url,
    viewer_id: String,
    request_timeout: Duration,
}

impl HttpBackend {
    pub fn new(settings: &BackendSettings) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|err| InfraError::http_client(err.to_string()))?;
        Ok(Self {
            client,
            base: settings.base_url.clone(),
            viewer_id: settings.viewer_id.clone(),
            request_timeout: settings.request_timeout,
        })
    }

    pub fn user_agent() -> &'static str {
        concat!("feedsync/", env!("CARGO_PKG_VERSION"))
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    fn url(&self, segments: &[&str]) -> Result<Url, GatewayError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| GatewayError::decode(format!("`{}` cannot be a base url", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn with_viewer(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(VIEWER_HEADER, self.viewer_id.as_str())
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, GatewayError> {
        let response = self
            .with_viewer(request)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, GatewayError> {
        let response = self.send(request).await?;
        let bytes = response.bytes().await.map_err(transport_error)?;
        serde_json::from_slice(&bytes).map_err(GatewayError::decode)
    }
}

fn transport_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::network(format!("request timed out: {err}"))
    } else if err.is_decode() {
        GatewayError::decode(err)
    } else {
        GatewayError::network(err)
    }
}

async fn check_status(response: Response) -> Result<Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::TOO_MANY_REQUESTS => Err(GatewayError::Throttled),
        StatusCode::NOT_FOUND => Err(GatewayError::NotFound),
        _ => {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&text)
                .map(|body| body.error.message)
                .unwrap_or(text);
            Err(GatewayError::rejected(status.as_u16(), message))
        }
    }
}

#[async_trait]
impl WorkflowTrigger for HttpBackend {
    #[instrument(skip(self, input), fields(feed_id = %input.feed_id_or_global()))]
    async fn start_save_post_workflow(
        &self,
        input: SavePostInput,
    ) -> Result<SavePostReceipt, GatewayError> {
        let url = self.url(&["posts"])?;
        self.fetch(self.client.post(url).json(&input)).await
    }
}

#[async_trait]
impl FeedReader for HttpBackend {
    async fn list_feed(&self, feed_id: &str) -> Result<Vec<PostRecord>, GatewayError> {
        let url = self.url(&["feeds", feed_id, "posts"])?;
        let response: ItemsResponse<PostRecord> = self.fetch(self.client.get(url)).await?;
        Ok(response.items)
    }

    async fn list_comments_for_post(
        &self,
        post_id: &str,
    ) -> Result<Vec<CommentRecord>, GatewayError> {
        let url = self.url(&["posts", post_id, "comments"])?;
        let response: ItemsResponse<CommentRecord> = self.fetch(self.client.get(url)).await?;
        Ok(response.items)
    }
}

/// Writes go out as the configured viewer.
#[async_trait]
impl FeedWriter for HttpBackend {
    async fn add_comment(&self, post_id: &str, body: &str) -> Result<CommentRecord, GatewayError> {
        let url = self.url(&["posts", post_id, "comments"])?;
        let request = CreateCommentRequest {
            body: body.to_string(),
        };
        self.fetch(self.client.post(url).json(&request)).await
    }

    async fn create_like(&self, post_id: &str) -> Result<LikeRecord, GatewayError> {
        let url = self.url(&["posts", post_id, "likes"])?;
        self.fetch(self.client.post(url)).await
    }

    async fn delete_like(&self, post_id: &str) -> Result<(), GatewayError> {
        let url = self.url(&["posts", post_id, "likes"])?;
        self.send(self.client.delete(url)).await.map(|_| ())
    }
}

#[async_trait]
impl EventChannel for HttpBackend {
    async fn subscribe(&self, feed_id: &str) -> Result<EventStream, GatewayError> {
        let url = self.url(&["feeds", feed_id, "events"])?;
        // No overall timeout: the body stays open for the lifetime of the subscription.
        let response = self
            .with_viewer(self.client.get(url))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        debug!(feed_id, "event stream opened");
        Ok(event_stream(response))
    }
}

fn event_stream(response: Response) -> EventStream {
    let mut body = response.bytes_stream();
    let events = stream! {
        let mut decoder = SseDecoder::default();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(chunk) => {
                    for data in decoder.push(&chunk) {
                        yield serde_json::from_str::<FeedEventEnvelope>(&data)
                            .map_err(GatewayError::decode);
                    }
                }
                Err(err) => {
                    yield Err(transport_error(err));
                    break;
                }
            }
        }
    };
    events.boxed()
}

/// Incremental decoder for `text/event-stream` bodies; yields the `data`
/// field of every complete event.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some((end, separator)) = find_event_end(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..end + separator).take(end).collect();
            let block = String::from_utf8_lossy(&block);
            if let Some(data) = event_data(&block) {
                events.push(data);
            }
        }
        events
    }
}

fn find_event_end(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|at| (at, 2));
    let crlf = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|at| (at, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn event_data(block: &str) -> Option<String> {
    let mut data: Option<String> = None;
    for line in block.lines() {
        let Some(value) = line.strip_prefix("data:") else {
            continue;
        };
        let value = value.strip_prefix(' ').unwrap_or(value);
        match data.as_mut() {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(value);
            }
            None => data = Some(value.to_string()),
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use httpmock::MockServer;

    use super::*;

    fn backend(server: &MockServer) -> HttpBackend {
        HttpBackend::new(&BackendSettings {
            base_url: Url::parse(&server.base_url()).expect("url"),
            request_timeout: Duration::from_secs(5),
            viewer_id: "alice".to_string(),
        })
        .expect("backend")
    }

    fn input() -> SavePostInput {
        SavePostInput {
            caption: "sunset".to_string(),
            photo_storage_key: "uploads/a.jpg".to_string(),
            photo_url: "https://cdn.test/a.jpg".to_string(),
            feed_id: None,
        }
    }

    #[test]
    fn decoder_handles_split_chunks_and_comments() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b": keep-alive\n\ndata: {\"a\"").is_empty());
        let events = decoder.push(b":1}\n\ndata: x\ndata: y\r\n\r\n");
        assert_eq!(events, vec!["{\"a\":1}".to_string(), "x\ny".to_string()]);
    }

    #[tokio::test]
    async fn start_workflow_posts_input_with_viewer() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method("POST")
                .path("/posts")
                .header("x-viewer-id", "alice")
                .json_body_includes(r#"{"caption":"sunset","photoStorageKey":"uploads/a.jpg"}"#);
            then.status(202)
                .header("content-type", "application/json")
                .body(r#"{"postId":"post-42","status":"QUEUED","submittedAt":"2024-05-01T12:00:00Z"}"#);
        });

        let receipt = backend(&server)
            .start_save_post_workflow(input())
            .await
            .expect("receipt");

        mock.assert();
        assert_eq!(receipt.post_id, "post-42");
    }

    #[tokio::test]
    async fn throttling_and_rejections_are_mapped() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("POST").path("/posts");
            then.status(429);
        });
        let err = backend(&server)
            .start_save_post_workflow(input())
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::Throttled);

        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("POST").path("/posts");
            then.status(400)
                .header("content-type", "application/json")
                .body(r#"{"error":{"code":"VALIDATION_FAILED","message":"caption must not be empty","hint":null}}"#);
        });
        let err = backend(&server)
            .start_save_post_workflow(input())
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::rejected(400, "caption must not be empty"));
    }

    #[tokio::test]
    async fn undecodable_receipt_is_a_decode_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("POST").path("/posts");
            then.status(202).body("not json");
        });

        let err = backend(&server)
            .start_save_post_workflow(input())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Decode(_)));
    }

    #[tokio::test]
    async fn list_feed_unwraps_items() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method("GET").path("/feeds/team/posts");
            then.status(200)
                .header("content-type", "application/json")
                .body(
                    r#"{"items":[{"id":"post-1","caption":"c","photoUrl":"u","moderationStatus":"APPROVED","likeCount":1,"commentCount":0,"createdAt":"2024-05-01T12:00:00Z","owner":"bob","feedId":"team"}]}"#,
                );
        });

        let posts = backend(&server).list_feed("team").await.expect("posts");

        mock.assert();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].owner, "bob");
    }

    #[tokio::test]
    async fn subscribe_decodes_event_stream() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("GET").path("/feeds/GLOBAL/events");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(concat!(
                    ": connected\n\n",
                    "data: {\"postId\":\"post-42\",\"type\":\"MODERATION_UPDATED\",\"payload\":{\"status\":\"APPROVED\"},\"createdAt\":\"2024-05-01T12:00:00Z\"}\n\n",
                    "data: garbage\n\n",
                ));
        });

        let events: Vec<_> = backend(&server)
            .subscribe("GLOBAL")
            .await
            .expect("subscribed")
            .collect()
            .await;

        assert_eq!(events.len(), 2);
        let first = events[0].as_ref().expect("decoded");
        assert_eq!(first.kind, "MODERATION_UPDATED");
        assert!(matches!(events[1], Err(GatewayError::Decode(_))));
    }

    #[tokio::test]
    async fn missing_post_maps_to_not_found() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("GET").path("/posts/post-9/comments");
            then.status(404);
        });

        let err = backend(&server)
            .list_comments_for_post("post-9")
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::NotFound);
    }

    #[tokio::test]
    async fn likes_use_the_post_likes_resource() {
        let server = MockServer::start();
        let create = server.mock(|when, then| {
            when.method("POST")
                .path("/posts/post-1/likes")
                .header("x-viewer-id", "alice");
            then.status(201)
                .header("content-type", "application/json")
                .body(r#"{"id":"like-1","postId":"post-1","owner":"alice","createdAt":"2024-05-01T12:00:00Z"}"#);
        });
        let delete = server.mock(|when, then| {
            when.method("DELETE")
                .path("/posts/post-1/likes")
                .header("x-viewer-id", "alice");
            then.status(204);
        });
        let backend = backend(&server);

        let like = backend.create_like("post-1").await.expect("like");
        backend.delete_like("post-1").await.expect("unlike");

        create.assert();
        delete.assert();
        assert_eq!(like.owner, "alice");
    }

    #[tokio::test]
    async fn add_comment_sends_body_as_viewer() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method("POST")
                .path("/posts/post-1/comments")
                .header("x-viewer-id", "alice")
                .json_body_includes(r#"{"body":"nice"}"#);
            then.status(201)
                .header("content-type", "application/json")
                .body(r#"{"id":"comment-1","postId":"post-1","owner":"alice","body":"nice","createdAt":"2024-05-01T12:00:00Z"}"#);
        });

        let comment = backend(&server)
            .add_comment("post-1", "nice")
            .await
            .expect("comment");

        mock.assert();
        assert_eq!(comment.id, "comment-1");
    }
}
