//! Subscription fetching and decoding
//!
//! A payload goes through a fixed list of detectors. The first detector that
//! recognizes it decodes it; decoders skip malformed records on their own.
//!
//! Detector order:
//! 1. `format=ssr|ss|clash` in the subscription URL
//! 2. `ssr://` links
//! 3. `ss://` links
//! 4. YAML/JSON document with a `proxies` array
//! 5. SSR links as the fallback

pub mod base64;
pub mod clash;
pub mod ss;
pub mod ssr;

use std::time::Duration;

use reqwest::{StatusCode, Url};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::node::Node;

pub const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Payload format forced by the subscription URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Ssr,
    Ss,
    Clash,
}

impl Format {
    pub fn from_hint(hint: &str) -> Option<Self> {
        match hint.to_ascii_lowercase().as_str() {
            "ssr" => Some(Format::Ssr),
            "ss" => Some(Format::Ss),
            "clash" => Some(Format::Clash),
            _ => None,
        }
    }
}

/// A detector returns `None` when the payload is not its format
type Detector = fn(&str, Option<Format>) -> Option<Result<Vec<Node>>>;

const DETECTORS: &[(&str, Detector)] = &[
    ("hint", detect_hint),
    ("ssr", detect_ssr),
    ("ss", detect_ss),
    ("clash", detect_clash),
    ("fallback", detect_fallback),
];

fn detect_hint(text: &str, hint: Option<Format>) -> Option<Result<Vec<Node>>> {
    match hint? {
        Format::Ssr => Some(Ok(ssr::parse_links(text))),
        Format::Ss => Some(Ok(ss::parse_links(text))),
        Format::Clash => Some(clash::parse(text)),
    }
}

fn detect_ssr(text: &str, _: Option<Format>) -> Option<Result<Vec<Node>>> {
    text.contains(ssr::SCHEME).then(|| Ok(ssr::parse_links(text)))
}

fn detect_ss(text: &str, _: Option<Format>) -> Option<Result<Vec<Node>>> {
    text.contains(ss::SCHEME).then(|| Ok(ss::parse_links(text)))
}

fn detect_clash(text: &str, _: Option<Format>) -> Option<Result<Vec<Node>>> {
    let document = clash::parse_document(text)?;
    clash::proxies(&document).map(|entries| Ok(clash::from_entries(entries)))
}

fn detect_fallback(text: &str, _: Option<Format>) -> Option<Result<Vec<Node>>> {
    Some(Ok(ssr::parse_links(text)))
}

/// Decode a subscription body into nodes. An empty result is an error.
pub fn parse_payload(body: &str, hint: Option<Format>) -> Result<Vec<Node>> {
    let text = self::base64::unwrap_body(body);

    for (name, detect) in DETECTORS {
        let Some(result) = detect(&text, hint) else {
            continue;
        };
        debug!("[subscription] Payload matched {} detector", name);
        let nodes = result?;
        if nodes.is_empty() {
            return Err(Error::Subscription(format!("no valid nodes in {} payload", name)));
        }
        return Ok(nodes);
    }

    Err(Error::Subscription("unrecognized payload".into()))
}

/// `?mu` at the end of a URL means `?mu=1`
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    if url.ends_with("?mu") || url.ends_with("&mu") {
        format!("{}=1", url)
    } else {
        url.to_string()
    }
}

/// `format=` query hint
pub fn format_hint(url: &str) -> Option<Format> {
    let url = Url::parse(url).ok()?;
    let hint = url
        .query_pairs()
        .find(|(key, _)| key == "format")
        .and_then(|(_, value)| Format::from_hint(&value));
    hint
}

/// HTTP client for subscription URLs
#[derive(Debug, Clone)]
pub struct SubscriptionClient {
    client: reqwest::Client,
}

impl SubscriptionClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Subscription(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// GET the subscription and decode it
    pub async fn fetch(&self, url: &str) -> Result<Vec<Node>> {
        let url = normalize_url(url);
        let parsed = Url::parse(&url).map_err(|e| Error::Config(format!("Invalid subscription URL: {}", e)))?;
        let host = parsed.host_str().unwrap_or("?").to_string();
        info!("[subscription] Fetching from {}", host);

        let response = self.client.get(parsed).send().await.map_err(request_error)?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::TOO_MANY_REQUESTS => {
                warn!("[subscription] {} is rate limiting, keeping current nodes", host);
                return Err(Error::RateLimited);
            }
            status => return Err(Error::Subscription(format!("HTTP {}", status))),
        }

        let body = response.text().await.map_err(request_error)?;
        let nodes = parse_payload(&body, format_hint(&url))?;
        info!("[subscription] Decoded {} nodes from {}", nodes.len(), host);
        Ok(nodes)
    }
}

fn request_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout
    } else {
        Error::Subscription(format!("request failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode as HttpStatus, routing::get, Router};

    const SS_LINK: &str = "ss://YWVzLTI1Ni1nY206cGFzcw==@example.com:8443#Test";

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client() -> SubscriptionClient {
        SubscriptionClient::new(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_ss_scenario() {
        let nodes = parse_payload(SS_LINK, None).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name(), "Test");
        assert_eq!(nodes[0].address(), "example.com");
        assert_eq!(nodes[0].port(), 8443);
        let tunnel = nodes[0].tunnel().unwrap();
        assert_eq!(tunnel.method, "aes-256-gcm");
        assert_eq!(tunnel.password, "pass");
    }

    #[test]
    fn test_base64_wrapped_payload() {
        let body = self::base64::encode_url_safe(format!("{}\n", SS_LINK).as_bytes());
        assert_eq!(parse_payload(&body, None).unwrap()[0].name(), "Test");
    }

    #[test]
    fn test_clash_detection() {
        let body = "proxies:\n  - {name: a, type: ss, server: a.example, port: 1, cipher: rc4-md5, password: p}\n";
        assert_eq!(parse_payload(body, None).unwrap()[0].name(), "a");
    }

    #[test]
    fn test_hint_forces_decoder() {
        // Forced SS decoding of an SSR list finds nothing
        let ssr_body = "ssr://MS4yLjMuNDo4MDpvcmlnaW46YWVzLTEyOC1jdHI6cGxhaW46Y0hjLw";
        assert!(parse_payload(ssr_body, Some(Format::Ss)).is_err());
        assert_eq!(parse_payload(ssr_body, Some(Format::Ssr)).unwrap().len(), 1);
    }

    #[test]
    fn test_unrecognized_payload_fails() {
        assert!(parse_payload("", None).is_err());
        assert!(parse_payload("<html>not found</html>", None).is_err());
    }

    #[test]
    fn test_url_helpers() {
        assert_eq!(normalize_url("https://a.example/sub?token=x&mu"), "https://a.example/sub?token=x&mu=1");
        assert_eq!(normalize_url("https://a.example/sub?mu"), "https://a.example/sub?mu=1");
        assert_eq!(normalize_url("https://a.example/sub?mu=0"), "https://a.example/sub?mu=0");

        assert_eq!(format_hint("https://a.example/s?format=clash"), Some(Format::Clash));
        assert_eq!(format_hint("https://a.example/s?token=1&format=SS"), Some(Format::Ss));
        assert_eq!(format_hint("https://a.example/s"), None);
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let base = serve(Router::new().route("/sub", get(|| async { SS_LINK }))).await;
        let nodes = client().fetch(&format!("{}/sub", base)).await.unwrap();
        assert_eq!(nodes[0].name(), "Test");
    }

    #[tokio::test]
    async fn test_fetch_rate_limited_and_errors() {
        let router = Router::new()
            .route("/busy", get(|| async { (HttpStatus::TOO_MANY_REQUESTS, "slow down") }))
            .route("/gone", get(|| async { (HttpStatus::NOT_FOUND, "missing") }))
            .route("/junk", get(|| async { "hello world" }));
        let base = serve(router).await;
        let client = client();

        assert!(matches!(client.fetch(&format!("{}/busy", base)).await, Err(Error::RateLimited)));
        assert!(matches!(client.fetch(&format!("{}/gone", base)).await, Err(Error::Subscription(_))));
        assert!(client.fetch(&format!("{}/junk", base)).await.is_err());
    }
}
