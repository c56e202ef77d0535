use std::collections::HashSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Client, Proxy};
use scraper::{Html, Node, Selector};
use tracing::debug;
use url::Url;

use crate::fetch::{FetchRequest, FetchResponse, Fetcher, PageLink};

const DEFAULT_USER_AGENT: &str = concat!("crawl-orchestrator/", env!("CARGO_PKG_VERSION"));

/// Plain HTTP collaborator: one GET per request, no script execution
pub struct HttpFetcher {
    client: Client,
    proxy: Option<String>,
}

impl HttpFetcher {
    pub fn new(proxy: Option<&str>) -> Result<Self> {
        Ok(Self {
            client: build_client(proxy)?,
            proxy: proxy.map(str::to_string),
        })
    }

    fn client_for(&self, request: &FetchRequest) -> Result<Client> {
        match &request.proxy {
            Some(proxy) if self.proxy.as_deref() != Some(proxy.as_str()) => build_client(Some(proxy)),
            _ => Ok(self.client.clone()),
        }
    }
}

fn build_client(proxy: Option<&str>) -> Result<Client> {
    let mut builder = Client::builder().cookie_store(true);
    if let Some(proxy) = proxy {
        builder = builder.proxy(Proxy::all(proxy).context(format!("Invalid proxy: {}", proxy))?);
    }
    builder.build().context("Failed to create HTTP client")
}

fn request_headers(request: &FetchRequest) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    let agent = request.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT);
    headers.insert(USER_AGENT, HeaderValue::from_str(agent).context("Invalid user agent")?);

    for (name, value) in &request.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .context(format!("Invalid header name: {}", name))?;
        let value = HeaderValue::from_str(value).context(format!("Invalid header value for {}", name))?;
        headers.insert(name, value);
    }

    Ok(headers)
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
        let client = self.client_for(request)?;

        debug!(url = %request.url, "GET");
        let response = client
            .get(&request.url)
            .headers(request_headers(request)?)
            .timeout(request.timeout)
            .send()
            .await
            .context(format!("Request to {} failed", request.url))?;

        let status = response.status();
        let final_url = response.url().to_string();
        let body = response
            .text()
            .await
            .context(format!("Failed to read body of {}", request.url))?;

        if !status.is_success() {
            return Ok(FetchResponse::failure(
                &final_url,
                Some(status.as_u16()),
                format!("HTTP {}", status),
            ));
        }

        let document = Html::parse_document(&body);
        Ok(FetchResponse {
            success: true,
            title: page_title(&document),
            links: page_links(&document, &final_url),
            markdown: page_text(&document),
            url: final_url,
            content: body,
            error: None,
            status_code: Some(status.as_u16()),
        })
    }
}

fn page_title(document: &Html) -> String {
    Selector::parse("title")
        .ok()
        .and_then(|s| document.select(&s).next().map(|t| t.text().collect::<String>()))
        .map(|t| t.trim().to_string())
        .unwrap_or_default()
}

/// Absolute http(s) links, first occurrence wins
fn page_links(document: &Html, base_url: &str) -> Vec<PageLink> {
    let (Ok(base), Ok(selector)) = (Url::parse(base_url), Selector::parse("a[href]")) else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for anchor in document.select(&selector) {
        let Some(href) = anchor.value().attr("href").map(str::trim) else {
            continue;
        };
        if href.is_empty() || href.starts_with('#') {
            continue;
        }
        let Ok(resolved) = base.join(href) else {
            continue;
        };
        if !matches!(resolved.scheme(), "http" | "https") {
            continue;
        }

        let href = resolved.to_string();
        if seen.insert(href.clone()) {
            links.push(PageLink {
                href,
                text: anchor.text().collect::<String>().trim().to_string(),
                class: anchor.value().attr("class").unwrap_or_default().to_string(),
            });
        }
    }
    links
}

/// Visible text of the body, one non-empty line per text run
fn page_text(document: &Html) -> String {
    let Ok(body) = Selector::parse("body") else {
        return String::new();
    };
    let Some(root) = document.select(&body).next() else {
        return String::new();
    };

    let mut lines = Vec::new();
    for node in root.descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|p| p.value().as_element().map(|e| matches!(e.name(), "script" | "style" | "noscript")))
            .unwrap_or(false);
        let text = text.trim();
        if !hidden && !text.is_empty() {
            lines.push(text.split_whitespace().collect::<Vec<_>>().join(" "));
        }
    }
    lines.join("\n")
}
