use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

pub mod http;
pub mod pagination;
pub mod remote;

// Re-export common types
pub use http::HttpFetcher;
pub use pagination::{detect_pagination, PaginationType};
pub use remote::RemoteBrowserFetcher;

/// Everything a collaborator needs to fetch one URL
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub url: String,
    pub timeout: Duration,
    pub headless: bool,
    pub user_agent: Option<String>,
    pub proxy: Option<String>,
    pub headers: HashMap<String, String>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
            headless: true,
            user_agent: None,
            proxy: None,
            headers: HashMap::new(),
        }
    }
}

/// A link found on a fetched page
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageLink {
    pub href: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub class: String,
}

/// What came back. The orchestrator only looks at `success`, `error` and
/// `status_code`; the rest is carried through to the results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchResponse {
    pub success: bool,
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub markdown: String,
    #[serde(default)]
    pub links: Vec<PageLink>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub status_code: Option<u16>,
}

impl FetchResponse {
    pub fn failure(url: &str, status_code: Option<u16>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            url: url.to_string(),
            error: Some(error.into()),
            status_code,
            ..Default::default()
        }
    }
}

/// The page fetching collaborator.
///
/// `Err` means the collaborator itself broke (connection refused, bad
/// reply); an `Ok` response with `success == false` is a fetch the remote
/// side refused or failed.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse>;
}
