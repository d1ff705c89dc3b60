//! Mock AniDB HTTP API server
//!
//! Provides a [`MockAniDbHttpServer`] that serves anime documents, error
//! documents and ban responses from the single `/httpapi` endpoint.

use std::time::Duration;

use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::fixtures;

const API_PATH: &str = "/httpapi";

/// Mock AniDB HTTP API for testing the HTTP connection handler and the jobs
/// that use it
///
/// # Example
///
/// ```rust,ignore
/// use tsundoku_test_utils::MockAniDbHttpServer;
///
/// #[tokio::test]
/// async fn test_anime_lookup() {
///     let server = MockAniDbHttpServer::start().await;
///     server.mock_anime(1, "Cowboy Bebop").await;
///
///     // Point HttpHandlerConfig::base_url at server.url()
/// }
/// ```
pub struct MockAniDbHttpServer {
    server: MockServer,
}

impl MockAniDbHttpServer {
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    /// Base URL to configure the HTTP handler with
    pub fn url(&self) -> String {
        format!("{}{}", self.server.uri(), API_PATH)
    }

    /// Mount a mock for an anime document
    pub async fn mock_anime(&self, aid: u64, title: &str) {
        Mock::given(method("GET"))
            .and(path(API_PATH))
            .and(query_param("request", "anime"))
            .and(query_param("aid", aid.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_string(fixtures::anime_xml(aid, title)))
            .mount(&self.server)
            .await;
    }

    /// Mount a mock for an anime document served after `delay`
    pub async fn mock_anime_slow(&self, aid: u64, title: &str, delay: Duration) {
        Mock::given(method("GET"))
            .and(path(API_PATH))
            .and(query_param("aid", aid.to_string()))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(fixtures::anime_xml(aid, title))
                    .set_delay(delay),
            )
            .mount(&self.server)
            .await;
    }

    /// Mount a mock that answers every request with the ban document
    pub async fn mock_banned(&self) {
        Mock::given(method("GET"))
            .and(path(API_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string(fixtures::banned_xml()))
            .mount(&self.server)
            .await;
    }

    /// Mount a mock for an `<error>` document
    pub async fn mock_error(&self, code: u16, message: &str) {
        Mock::given(method("GET"))
            .and(path(API_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                r#"<?xml version="1.0" encoding="UTF-8"?><error code="{}">{}</error>"#,
                code, message
            )))
            .mount(&self.server)
            .await;
    }

    /// Mount a mock that answers with a bare status code
    pub async fn mock_status(&self, status: u16) {
        Mock::given(method("GET"))
            .and(path(API_PATH))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
    }

    /// Number of requests the server received
    pub async fn request_count(&self) -> usize {
        self.server
            .received_requests()
            .await
            .map(|requests| requests.len())
            .unwrap_or(0)
    }

    /// Query string of every request received, oldest first
    pub async fn request_queries(&self) -> Vec<String> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|request| request.url.query().unwrap_or_default().to_string())
            .collect()
    }
}
