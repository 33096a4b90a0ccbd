//! REST client for the Verdant API.
//!
//! Every response carries the server's `version`, so REST results merge into
//! the caches under the same ordering rule as pushed events.

use chrono::{DateTime, Utc};
use reqwest::{Client, Method, StatusCode, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, instrument};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::types::{
    CareTask, Comment, CommunityPost, Credentials, Envelope, LikeChange, NewCareTask, NewPost,
    PlantHealthRecord, TaskPatch, VersionOnly,
};

/// Client for the REST boundary.
#[derive(Clone)]
pub struct RestClient {
    http: Client,
    base_url: Url,
    credentials: Credentials,
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url.as_str())
            .field("user_id", &self.credentials.user_id)
            .finish()
    }
}

impl RestClient {
    /// Create a client for `config.api_url`.
    pub fn new(config: &SyncConfig, credentials: Credentials) -> Result<Self, SyncError> {
        let base_url = Url::parse(&config.api_url)
            .map_err(|e| SyncError::InvalidConfig(format!("invalid api_url: {}", e)))?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::InvalidConfig(format!(
                "api_url cannot be a base url: {}",
                config.api_url
            )));
        }

        let http = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            http,
            base_url,
            credentials,
        })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// `{base}/api/{segments...}` with each segment percent-encoded.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push("api").extend(segments);
        }
        url
    }

    async fn request<T, B>(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<&B>,
        resource: &str,
        id: &str,
    ) -> Result<T, SyncError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = self.url(segments);
        debug!(%method, %url, "sending request");

        let mut request = self
            .http
            .request(method, url)
            .bearer_auth(&self.credentials.token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        handle_response(response, resource, id).await
    }

    // =========================================================================
    // Care tasks
    // =========================================================================

    #[instrument(skip(self))]
    pub async fn list_tasks(&self) -> Result<Envelope<Vec<CareTask>>, SyncError> {
        self.request::<_, ()>(Method::GET, &["care-tasks"], None, "care-task", "")
            .await
    }

    #[instrument(skip(self, task), fields(plant_id = %task.plant_id))]
    pub async fn create_task(&self, task: &NewCareTask) -> Result<Envelope<CareTask>, SyncError> {
        self.request(Method::POST, &["care-tasks"], Some(task), "care-task", "")
            .await
    }

    #[instrument(skip(self, patch))]
    pub async fn update_task(
        &self,
        id: &str,
        patch: &TaskPatch,
    ) -> Result<Envelope<CareTask>, SyncError> {
        self.request(Method::PATCH, &["care-tasks", id], Some(patch), "care-task", id)
            .await
    }

    #[instrument(skip(self))]
    pub async fn complete_task(&self, id: &str) -> Result<Envelope<CareTask>, SyncError> {
        self.request::<_, ()>(
            Method::POST,
            &["care-tasks", id, "complete"],
            None,
            "care-task",
            id,
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn snooze_task(
        &self,
        id: &str,
        until: DateTime<Utc>,
    ) -> Result<Envelope<CareTask>, SyncError> {
        let body = json!({ "until": until });
        self.request(
            Method::POST,
            &["care-tasks", id, "snooze"],
            Some(&body),
            "care-task",
            id,
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn delete_task(&self, id: &str) -> Result<VersionOnly, SyncError> {
        self.request::<_, ()>(Method::DELETE, &["care-tasks", id], None, "care-task", id)
            .await
    }

    // =========================================================================
    // Plant health
    // =========================================================================

    #[instrument(skip(self))]
    pub async fn trigger_health_check(
        &self,
        plant_id: &str,
    ) -> Result<Envelope<PlantHealthRecord>, SyncError> {
        self.request::<_, ()>(
            Method::POST,
            &["plants", plant_id, "health-check"],
            None,
            "plant",
            plant_id,
        )
        .await
    }

    // =========================================================================
    // Community
    // =========================================================================

    #[instrument(skip(self))]
    pub async fn list_posts(&self) -> Result<Envelope<Vec<CommunityPost>>, SyncError> {
        self.request::<_, ()>(Method::GET, &["community", "posts"], None, "post", "")
            .await
    }

    #[instrument(skip(self, post))]
    pub async fn create_post(&self, post: &NewPost) -> Result<Envelope<CommunityPost>, SyncError> {
        self.request(Method::POST, &["community", "posts"], Some(post), "post", "")
            .await
    }

    #[instrument(skip(self))]
    pub async fn delete_post(&self, id: &str) -> Result<VersionOnly, SyncError> {
        self.request::<_, ()>(Method::DELETE, &["community", "posts", id], None, "post", id)
            .await
    }

    #[instrument(skip(self))]
    pub async fn like_post(&self, id: &str) -> Result<Envelope<LikeChange>, SyncError> {
        self.request::<_, ()>(
            Method::POST,
            &["community", "posts", id, "like"],
            None,
            "post",
            id,
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn unlike_post(&self, id: &str) -> Result<Envelope<LikeChange>, SyncError> {
        self.request::<_, ()>(
            Method::DELETE,
            &["community", "posts", id, "like"],
            None,
            "post",
            id,
        )
        .await
    }

    #[instrument(skip(self, content))]
    pub async fn add_comment(
        &self,
        post_id: &str,
        content: &str,
    ) -> Result<Envelope<Comment>, SyncError> {
        let body = json!({ "content": content });
        self.request(
            Method::POST,
            &["community", "posts", post_id, "comments"],
            Some(&body),
            "post",
            post_id,
        )
        .await
    }
}

/// Error body returned by the API.
#[derive(Debug, serde::Deserialize)]
struct ApiError {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Map a response to its JSON body or a typed error.
async fn handle_response<T: DeserializeOwned>(
    response: reqwest::Response,
    resource: &str,
    id: &str,
) -> Result<T, SyncError> {
    let status = response.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok());
        return Err(SyncError::RateLimited { retry_after_secs });
    }

    if status == StatusCode::NOT_FOUND {
        return Err(SyncError::NotFound {
            resource: resource.to_string(),
            id: id.to_string(),
        });
    }

    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiError>(&text)
            .ok()
            .and_then(|e| e.message.or(e.error))
            .unwrap_or(text);

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SyncError::Auth(message));
        }
        return Err(SyncError::Api {
            status: status.as_u16(),
            message,
        });
    }

    let body = response.json().await?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timestamp;
    use chrono::TimeZone;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(uri: &str) -> RestClient {
        let config = SyncConfig::builder().api_url(uri).build();
        RestClient::new(&config, Credentials::new("u1", "tok")).unwrap()
    }

    fn task_json(id: &str, completed: bool) -> serde_json::Value {
        json!({
            "id": id,
            "plantId": "p1",
            "kind": "water",
            "title": "Water the fern",
            "priority": "high",
            "dueDate": "2026-05-14T08:00:00Z",
            "completed": completed
        })
    }

    #[test]
    fn test_url_encodes_segments() {
        let client = client("http://localhost:3000");
        let url = client.url(&["care-tasks", "a/b", "complete"]);
        assert_eq!(url.path(), "/api/care-tasks/a%2Fb/complete");
    }

    #[test]
    fn test_invalid_base_url() {
        let config = SyncConfig::builder().api_url("not a url").build();
        let result = RestClient::new(&config, Credentials::new("u1", "tok"));
        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_list_tasks_sends_bearer_token() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/care-tasks"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [task_json("t1", false), task_json("t2", true)],
                "version": 12
            })))
            .mount(&mock_server)
            .await;

        let result = client(&mock_server.uri()).list_tasks().await.unwrap();
        assert_eq!(result.version, Timestamp(12));
        assert_eq!(result.data.len(), 2);
        assert!(result.data[1].completed);
    }

    #[tokio::test]
    async fn test_snooze_sends_until() {
        let mock_server = MockServer::start().await;
        let until = Utc.with_ymd_and_hms(2026, 5, 20, 9, 0, 0).unwrap();

        Mock::given(method("POST"))
            .and(path("/api/care-tasks/t1/snooze"))
            .and(body_partial_json(json!({ "until": until })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": task_json("t1", false),
                "version": 3
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let result = client(&mock_server.uri()).snooze_task("t1", until).await.unwrap();
        assert_eq!(result.data.id, "t1");
    }

    #[tokio::test]
    async fn test_delete_returns_version() {
        let mock_server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/api/community/posts/p9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "version": 40 })))
            .mount(&mock_server)
            .await;

        let result = client(&mock_server.uri()).delete_post("p9").await.unwrap();
        assert_eq!(result.version, Timestamp(40));
    }

    #[tokio::test]
    async fn test_like_post() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/community/posts/p1/like"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "postId": "p1", "userId": "u1", "likeCount": 4 },
                "version": 8
            })))
            .mount(&mock_server)
            .await;

        let result = client(&mock_server.uri()).like_post("p1").await.unwrap();
        assert_eq!(result.data.like_count, 4);
        assert_eq!(result.version, Timestamp(8));
    }

    #[tokio::test]
    async fn test_not_found() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/care-tasks/missing/complete"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let result = client(&mock_server.uri()).complete_task("missing").await;
        match result {
            Err(SyncError::NotFound { resource, id }) => {
                assert_eq!(resource, "care-task");
                assert_eq!(id, "missing");
            }
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rate_limited() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/community/posts"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
            .mount(&mock_server)
            .await;

        let result = client(&mock_server.uri()).list_posts().await;
        assert!(matches!(
            result,
            Err(SyncError::RateLimited {
                retry_after_secs: Some(7)
            })
        ));
    }

    #[tokio::test]
    async fn test_unauthorized() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/plants/p1/health-check"))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(json!({ "error": "token expired" })),
            )
            .mount(&mock_server)
            .await;

        let result = client(&mock_server.uri()).trigger_health_check("p1").await;
        match result {
            Err(SyncError::Auth(message)) => assert_eq!(message, "token expired"),
            other => panic!("expected Auth, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_error_message() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/community/posts/p1/comments"))
            .respond_with(
                ResponseTemplate::new(500).set_body_json(json!({ "message": "database unavailable" })),
            )
            .mount(&mock_server)
            .await;

        let result = client(&mock_server.uri()).add_comment("p1", "lovely").await;
        match result {
            Err(SyncError::Api { status, message }) => {
                assert_eq!(status, 500);
                assert_eq!(message, "database unavailable");
            }
            other => panic!("expected Api, got {:?}", other),
        }
    }
}
