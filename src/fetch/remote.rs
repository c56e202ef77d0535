use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::fetch::{FetchRequest, FetchResponse, Fetcher, PageLink};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserServiceRequest {
    pub url: String,
    pub headless: bool,
    pub timeout_ms: u64,
    pub user_agent: Option<String>,
    pub proxy: Option<String>,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserServiceResponse {
    pub success: bool,
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub markdown: String,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub status_code: Option<u16>,
}

impl From<BrowserServiceResponse> for FetchResponse {
    fn from(reply: BrowserServiceResponse) -> Self {
        Self {
            success: reply.success,
            url: reply.url,
            title: reply.title,
            content: reply.content,
            markdown: reply.markdown,
            links: reply
                .links
                .into_iter()
                .map(|href| PageLink {
                    href,
                    ..Default::default()
                })
                .collect(),
            error: reply.error,
            status_code: reply.status_code,
        }
    }
}

/// Rendering service reached over HTTP at `{base}/crawl`
pub struct RemoteBrowserFetcher {
    client: Client,
    base_url: String,
}

impl RemoteBrowserFetcher {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Fetcher for RemoteBrowserFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
        let endpoint = format!("{}/crawl", self.base_url);

        let body = BrowserServiceRequest {
            url: request.url.clone(),
            headless: request.headless,
            timeout_ms: request.timeout.as_millis() as u64,
            user_agent: request.user_agent.clone(),
            proxy: request.proxy.clone(),
            headers: request.headers.clone(),
        };

        debug!("Sending request to browser service: {}", request.url);

        // The service gets its own page timeout plus some slack for the round trip
        let reply = self
            .client
            .post(&endpoint)
            .json(&body)
            .timeout(request.timeout + std::time::Duration::from_secs(10))
            .send()
            .await
            .context("Failed to send request to browser service")?
            .json::<BrowserServiceResponse>()
            .await
            .context("Failed to parse browser service response")?;

        if !reply.success {
            error!(
                "Browser service error for {}: {}",
                request.url,
                reply.error.as_deref().unwrap_or("unknown error")
            );
        }

        Ok(reply.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_posts_to_crawl_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/crawl"))
            .and(body_partial_json(json!({"url": "https://example.com/a", "headless": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "url": "https://example.com/a",
                "title": "A",
                "content": "<p>a</p>",
                "links": ["https://example.com/b"]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = RemoteBrowserFetcher::new(&format!("{}/", server.uri())).unwrap();
        let mut request = FetchRequest::new("https://example.com/a", Duration::from_secs(5));
        request.headless = false;

        let response = fetcher.fetch(&request).await.unwrap();
        assert!(response.success);
        assert_eq!(response.title, "A");
        assert_eq!(response.links[0].href, "https://example.com/b");
    }

    #[tokio::test]
    async fn test_service_failure_is_reported_not_raised() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/crawl"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "url": "https://example.com/a",
                "error": "blocked",
                "status_code": 403
            })))
            .mount(&server)
            .await;

        let fetcher = RemoteBrowserFetcher::new(&server.uri()).unwrap();
        let request = FetchRequest::new("https://example.com/a", Duration::from_secs(5));
        let response = fetcher.fetch(&request).await.unwrap();

        assert!(!response.success);
        assert_eq!(response.status_code, Some(403));
        assert_eq!(response.error.as_deref(), Some("blocked"));
    }

    #[tokio::test]
    async fn test_garbage_reply_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("oops"))
            .mount(&server)
            .await;

        let fetcher = RemoteBrowserFetcher::new(&server.uri()).unwrap();
        let request = FetchRequest::new("https://example.com/a", Duration::from_secs(5));
        assert!(fetcher.fetch(&request).await.is_err());
    }
}
