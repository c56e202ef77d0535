use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::CrawlError;

/// Normalized `scheme://host[:port]` identity of a URL.
///
/// Every per-site structure (throttles, gates, backoff state, learned
/// patterns) is keyed by this. Two URLs on the same host always produce the
/// same key whatever their path, query or fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OriginKey {
    key: String,
    host: String,
}

impl OriginKey {
    /// Parse the origin out of an absolute URL
    pub fn parse(url: &str) -> Result<Self, CrawlError> {
        let parsed = Url::parse(url.trim())
            .map_err(|e| CrawlError::Configuration(format!("invalid URL '{}': {}", url, e)))?;
        Self::from_url(&parsed)
    }

    pub fn from_url(url: &Url) -> Result<Self, CrawlError> {
        let host = url
            .host_str()
            .ok_or_else(|| CrawlError::Configuration(format!("URL has no host: {}", url)))?;

        // The url crate already lowercases the scheme and drops default ports
        let host = host.to_lowercase();
        let mut key = format!("{}://{}", url.scheme(), host);
        if let Some(port) = url.port() {
            key.push_str(&format!(":{}", port));
        }

        Ok(Self {
            key,
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
        })
    }

    /// Host part only, without port or IPv6 brackets
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for OriginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl TryFrom<String> for OriginKey {
    type Error = CrawlError;

    fn try_from(origin: String) -> Result<Self, Self::Error> {
        Self::parse(&origin)
    }
}

impl From<OriginKey> for String {
    fn from(origin: OriginKey) -> Self {
        origin.key
    }
}

fn numeric_segment() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/\d+").expect("static regex"))
}

fn numeric_value() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"=\d+").expect("static regex"))
}

/// Reduce a URL to its shape: numeric path segments and numeric query
/// values become `*`, so `/articles/42?page=3` and `/articles/7?page=9`
/// share the shape `/articles/*?page=*`.
pub fn url_shape(url: &str) -> Result<String, CrawlError> {
    let parsed = Url::parse(url.trim())
        .map_err(|e| CrawlError::Configuration(format!("invalid URL '{}': {}", url, e)))?;

    let mut shape = numeric_segment().replace_all(parsed.path(), "/*").into_owned();
    if let Some(query) = parsed.query().filter(|q| !q.is_empty()) {
        shape.push('?');
        shape.push_str(&numeric_value().replace_all(query, "=*"));
    }

    Ok(shape)
}

/// Wildcard match of a concrete shape against a stored shape.
///
/// `*` in `pattern` stands for any run of characters inside one path
/// segment; it never crosses a `/`.
pub fn shape_matches(shape: &str, pattern: &str) -> bool {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for (i, literal) in pattern.split('*').enumerate() {
        if i > 0 {
            expr.push_str("[^/]*");
        }
        expr.push_str(&regex::escape(literal));
    }
    expr.push('$');

    Regex::new(&expr).map(|re| re.is_match(shape)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_ignores_path() {
        let a = OriginKey::parse("https://Example.com/a/b?x=1").unwrap();
        let b = OriginKey::parse("https://example.com/other#frag").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "https://example.com");
        assert_eq!(a.host(), "example.com");
    }

    #[test]
    fn test_origin_ports() {
        assert_eq!(
            OriginKey::parse("https://example.com:443/x").unwrap().as_str(),
            "https://example.com"
        );
        let custom = OriginKey::parse("http://localhost:8080/x").unwrap();
        assert_eq!(custom.as_str(), "http://localhost:8080");
        assert_eq!(custom.host(), "localhost");
    }

    #[test]
    fn test_origin_ipv6_host() {
        let origin = OriginKey::parse("http://[::1]:8080/status").unwrap();
        assert_eq!(origin.as_str(), "http://[::1]:8080");
        assert_eq!(origin.host(), "::1");

        let json = serde_json::to_string(&origin).unwrap();
        assert_eq!(json, "\"http://[::1]:8080\"");
        assert_eq!(serde_json::from_str::<OriginKey>(&json).unwrap(), origin);
    }

    #[test]
    fn test_origin_rejects_garbage() {
        assert!(matches!(
            OriginKey::parse("not a url"),
            Err(CrawlError::Configuration(_))
        ));
        assert!(OriginKey::parse("mailto:someone@example.com").is_err());
    }

    #[test]
    fn test_url_shape() {
        assert_eq!(url_shape("https://example.com/articles/42").unwrap(), "/articles/*");
        assert_eq!(
            url_shape("https://example.com/list?page=3&sort=new").unwrap(),
            "/list?page=*&sort=new"
        );
        assert_eq!(
            url_shape("https://example.com/articles/42/comments").unwrap(),
            "/articles/*/comments"
        );
    }

    #[test]
    fn test_wildcard_stays_in_segment() {
        let shape_42 = url_shape("https://example.com/articles/42").unwrap();
        let shape_7 = url_shape("https://example.com/articles/7").unwrap();
        let nested = url_shape("https://example.com/articles/42/comments").unwrap();

        assert!(shape_matches(&shape_42, "/articles/*"));
        assert!(shape_matches(&shape_7, "/articles/*"));
        assert!(!shape_matches(&nested, "/articles/*"));
        assert!(shape_matches("/articles/draft", "/articles/*"));
        assert!(!shape_matches("/news/1", "/articles/*"));
    }
}
