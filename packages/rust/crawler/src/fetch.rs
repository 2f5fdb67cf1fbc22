//! Polite HTTP fetcher shared by discovery (listings) and the fetch stage
//! (documents).
//!
//! Every request goes through the [`DomainRateLimiter`] and the SSRF guard.
//! Failures are split into [`FetchError::Transient`] (worth retrying) and
//! [`FetchError::Permanent`].

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regtruth_shared::{FetchConfig, RegTruthError, sha256_hex};
use reqwest::{Client, StatusCode};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::rate_limit::DomainRateLimiter;

/// User-Agent string for all outbound requests.
const USER_AGENT: &str = concat!("RegTruth/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Timeouts, connection resets, 408/425/429 and 5xx.
    #[error("transient fetch failure: {0}")]
    Transient(String),

    /// Anything retrying cannot fix: 4xx, DNS failure, blocked target, oversize body.
    #[error("permanent fetch failure: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<FetchError> for RegTruthError {
    fn from(err: FetchError) -> Self {
        RegTruthError::Network(err.to_string())
    }
}

/// A successfully fetched response body.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub url: String,
    /// URL after redirects.
    pub final_url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub content_hash: String,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedDocument {
    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub struct Fetcher {
    client: Client,
    limiter: Arc<DomainRateLimiter>,
    max_body_bytes: u64,
    allow_private_hosts: bool,
}

impl Fetcher {
    pub fn new(config: &FetchConfig, limiter: Arc<DomainRateLimiter>) -> regtruth_shared::Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RegTruthError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            limiter,
            max_body_bytes: config.max_body_bytes,
            allow_private_hosts: config.allow_private_hosts,
        })
    }

    /// Allow localhost/private IPs (mock servers in tests).
    pub fn allow_private_hosts(mut self) -> Self {
        self.allow_private_hosts = true;
        self
    }

    pub fn limiter(&self) -> &Arc<DomainRateLimiter> {
        &self.limiter
    }

    /// GET `url` under the domain's rate limit.
    #[instrument(skip_all, fields(url = %url))]
    pub async fn fetch(&self, url: &str) -> Result<FetchedDocument, FetchError> {
        let parsed =
            Url::parse(url).map_err(|e| FetchError::Permanent(format!("invalid URL {url}: {e}")))?;
        if !self.allow_private_hosts && is_ssrf_target(&parsed) {
            warn!(%url, "SSRF protection: blocked");
            return Err(FetchError::Permanent(format!("{url}: blocked private or non-HTTP target")));
        }

        let _permit = self.limiter.acquire(url).await?;
        debug!(%url, "fetching");

        let mut response = self
            .client
            .get(parsed.as_str())
            .send()
            .await
            .map_err(|e| classify_reqwest_error(url, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(url, status));
        }

        if let Some(len) = response.content_length() {
            if len > self.max_body_bytes {
                return Err(FetchError::Permanent(format!(
                    "{url}: body of {len} bytes exceeds limit of {}",
                    self.max_body_bytes
                )));
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let final_url = response.url().to_string();

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| classify_reqwest_error(url, &e))?
        {
            if body.len() as u64 + chunk.len() as u64 > self.max_body_bytes {
                return Err(FetchError::Permanent(format!(
                    "{url}: body exceeds limit of {} bytes",
                    self.max_body_bytes
                )));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(FetchedDocument {
            url: url.to_string(),
            final_url,
            status: status.as_u16(),
            content_type,
            content_hash: sha256_hex(&body),
            body,
            fetched_at: Utc::now(),
        })
    }

    /// Fetch a listing (sitemap, feed, HTML page) as text.
    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        Ok(self.fetch(url).await?.text())
    }
}

// ---------------------------------------------------------------------------
// Failure classification
// ---------------------------------------------------------------------------

fn classify_status(url: &str, status: StatusCode) -> FetchError {
    let msg = format!("{url}: HTTP {status}");
    match status.as_u16() {
        408 | 425 | 429 => FetchError::Transient(msg),
        s if s >= 500 => FetchError::Transient(msg),
        _ => FetchError::Permanent(msg),
    }
}

fn classify_reqwest_error(url: &str, err: &reqwest::Error) -> FetchError {
    let msg = format!("{url}: {err}");
    if is_dns_failure(err) {
        return FetchError::Permanent(msg);
    }
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        return FetchError::Transient(msg);
    }
    if err.is_builder() || err.is_redirect() {
        return FetchError::Permanent(msg);
    }
    FetchError::Transient(msg)
}

fn is_dns_failure(err: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        let text = e.to_string().to_ascii_lowercase();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return true;
        }
        source = e.source();
    }
    false
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
pub fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            host == "localhost" || host.ends_with(".local") || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regtruth_shared::RateLimitsConfig;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher() -> Fetcher {
        let limiter = Arc::new(DomainRateLimiter::new(RateLimitsConfig {
            min_delay_ms: 0,
            max_delay_ms: 0,
            max_concurrent: 2,
            domains: Vec::new(),
        }));
        let config = FetchConfig {
            max_body_bytes: 64,
            ..FetchConfig::default()
        };
        Fetcher::new(&config, limiter).unwrap().allow_private_hosts()
    }

    #[test]
    fn ssrf_blocks_private_and_non_http() {
        for raw in [
            "file:///etc/passwd",
            "http://192.168.1.1/admin",
            "http://10.0.0.1/",
            "http://127.0.0.1:8080/",
            "http://localhost:3000/api",
            "http://[::1]/",
        ] {
            assert!(is_ssrf_target(&Url::parse(raw).unwrap()), "{raw}");
        }
        assert!(!is_ssrf_target(&Url::parse("https://porezna-uprava.example/vijesti").unwrap()));
    }

    #[test]
    fn status_classification() {
        assert!(classify_status("u", StatusCode::SERVICE_UNAVAILABLE).is_transient());
        assert!(classify_status("u", StatusCode::TOO_MANY_REQUESTS).is_transient());
        assert!(classify_status("u", StatusCode::REQUEST_TIMEOUT).is_transient());
        assert!(!classify_status("u", StatusCode::NOT_FOUND).is_transient());
        assert!(!classify_status("u", StatusCode::FORBIDDEN).is_transient());
    }

    #[tokio::test]
    async fn fetches_body_and_hash() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/doc"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("<p>hello</p>", "text/html; charset=utf-8"),
            )
            .mount(&server)
            .await;

        let doc = fetcher()
            .fetch(&format!("{}/doc", server.uri()))
            .await
            .unwrap();
        assert_eq!(doc.status, 200);
        assert_eq!(doc.text(), "<p>hello</p>");
        assert_eq!(doc.content_hash, sha256_hex(b"<p>hello</p>"));
        assert!(doc.content_type.unwrap().starts_with("text/html"));
    }

    #[tokio::test]
    async fn maps_http_failures() {
        let server = MockServer::start().await;
        Mock::given(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(path("/busy"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(path("/huge"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(1000)))
            .mount(&server)
            .await;

        let f = fetcher();
        let gone = f.fetch(&format!("{}/gone", server.uri())).await.unwrap_err();
        assert!(!gone.is_transient());
        let busy = f.fetch(&format!("{}/busy", server.uri())).await.unwrap_err();
        assert!(busy.is_transient());
        let huge = f.fetch(&format!("{}/huge", server.uri())).await.unwrap_err();
        assert!(!huge.is_transient());
    }

    #[tokio::test]
    async fn blocks_private_hosts_by_default() {
        let limiter = Arc::new(DomainRateLimiter::new(RateLimitsConfig::default()));
        let f = Fetcher::new(&FetchConfig::default(), limiter).unwrap();
        let err = f.fetch("http://127.0.0.1:9/").await.unwrap_err();
        assert!(matches!(err, FetchError::Permanent(_)));
    }
}
