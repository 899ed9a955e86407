//! Polite outbound HTTP client: per-host token buckets, retries with
//! backoff and jitter, deadline budgets, response-size caps, and in-flight
//! request coalescing. All source adapters go through [`Gateway::fetch`].

pub mod rate_limit;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, broadcast};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use rate_limit::{AcquireError, HostBuckets, HostPolicy};

/// Default response-size cap. Adapters may override per request.
pub const DEFAULT_SIZE_CAP: usize = 8 * 1024 * 1024;

const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Network,
    Timeout,
    RateLimitTimeout,
    /// 5xx (or 429) that survived all retries.
    Server,
    /// Non-retriable 4xx.
    Client,
    Oversize,
    /// Reported back by adapters when a body fails to parse.
    ParseUpstream,
    Cancelled,
}

impl FetchErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::RateLimitTimeout => "rate-limit-timeout",
            Self::Server => "server",
            Self::Client => "client",
            Self::Oversize => "oversize",
            Self::ParseUpstream => "parse-upstream",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub host: String,
    pub elapsed: Duration,
    pub last_status: Option<u16>,
    pub message: String,
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} from {} after {:?}: {}",
            self.kind.as_str(),
            self.host,
            self.elapsed,
            self.message
        )
    }
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: reqwest::Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub size_cap: usize,
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: reqwest::Method::GET,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            size_cap: DEFAULT_SIZE_CAP,
            deadline: Instant::now() + Duration::from_secs(30),
            cancel: CancellationToken::new(),
        }
    }

    pub fn post(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: reqwest::Method::POST,
            body: Some(body),
            ..Self::get(url)
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn size_cap(mut self, cap: usize) -> Self {
        self.size_cap = cap;
        self
    }

    fn coalesce_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.method.as_str().as_bytes());
        hasher.update(b"\0");
        hasher.update(self.url.as_bytes());
        hasher.update(b"\0");
        if let Some(body) = &self.body {
            hasher.update(body);
        }
        format!("{:x}", hasher.finalize())
    }
}

type CoalesceResult = Result<FetchResponse, FetchError>;

pub struct GatewayConfig {
    pub user_agent: String,
    pub proxy: Option<String>,
    pub policies: HashMap<String, HostPolicy>,
}

impl GatewayConfig {
    pub fn new(user_agent: String) -> Self {
        Self {
            user_agent,
            proxy: None,
            policies: default_policies(),
        }
    }
}

/// Built-in per-host rate policies for the known sources.
pub fn default_policies() -> HashMap<String, HostPolicy> {
    let mut p = HashMap::new();
    p.insert("eutils.ncbi.nlm.nih.gov".into(), HostPolicy::new(3.0, 3.0));
    p.insert("www.ncbi.nlm.nih.gov".into(), HostPolicy::new(3.0, 3.0));
    p.insert("www.ebi.ac.uk".into(), HostPolicy::new(5.0, 10.0));
    p.insert("api.openalex.org".into(), HostPolicy::new(10.0, 10.0));
    p.insert("api.semanticscholar.org".into(), HostPolicy::new(1.0, 2.0));
    p.insert("api.crossref.org".into(), HostPolicy::new(10.0, 10.0));
    p.insert("api.core.ac.uk".into(), HostPolicy::new(5.0, 5.0));
    p.insert("mygene.info".into(), HostPolicy::new(10.0, 10.0));
    p.insert("myvariant.info".into(), HostPolicy::new(10.0, 10.0));
    p.insert("mychem.info".into(), HostPolicy::new(10.0, 10.0));
    p.insert("openi.nlm.nih.gov".into(), HostPolicy::new(3.0, 3.0));
    p
}

pub struct Gateway {
    client: reqwest::Client,
    buckets: HostBuckets,
    coalesce: Mutex<HashMap<String, broadcast::Sender<CoalesceResult>>>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Result<Self, crate::LitMcpError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(10));
        if let Some(proxy) = &config.proxy {
            let proxy = reqwest::Proxy::all(proxy).map_err(|e| {
                crate::LitMcpError::InvalidInput(format!("Invalid proxy URL: {e}"))
            })?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build().map_err(|e| {
            crate::LitMcpError::Internal(format!("Failed to build HTTP client: {e}"))
        })?;
        Ok(Self {
            client,
            buckets: HostBuckets::new(config.policies),
            coalesce: Mutex::new(HashMap::new()),
        })
    }

    /// Fetch with host rate limiting, retries, and coalescing. Concurrent
    /// calls for the same `(method, url, body)` share one upstream request.
    pub async fn fetch(&self, request: FetchRequest) -> CoalesceResult {
        let key = request.coalesce_key();
        let mut rx = {
            let mut table = self.coalesce.lock().await;
            match table.get(&key) {
                Some(tx) => Some(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    table.insert(key.clone(), tx);
                    None
                }
            }
        };

        if let Some(rx) = rx.as_mut() {
            match rx.recv().await {
                Ok(result) => return result,
                // Leader dropped without publishing; fall through and fetch
                // on our own.
                Err(_) => {}
            }
        }

        let result = self.execute(&request).await;

        let mut table = self.coalesce.lock().await;
        if let Some(tx) = table.remove(&key) {
            let _ = tx.send(result.clone());
        }
        result
    }

    async fn execute(&self, request: &FetchRequest) -> CoalesceResult {
        let started = Instant::now();
        let host = match Url::parse(&request.url) {
            Ok(url) => url.host_str().unwrap_or("").to_ascii_lowercase(),
            Err(e) => {
                return Err(FetchError {
                    kind: FetchErrorKind::Client,
                    host: String::new(),
                    elapsed: Duration::ZERO,
                    last_status: None,
                    message: format!("Invalid URL: {e}"),
                });
            }
        };

        let fail = |kind: FetchErrorKind, last_status: Option<u16>, message: String| FetchError {
            kind,
            host: host.clone(),
            elapsed: Instant::now().saturating_duration_since(started),
            last_status,
            message,
        };

        let mut last_status: Option<u16> = None;
        let mut last_error = String::new();
        let mut retry_after: Option<Duration> = None;

        for attempt in 1..=MAX_ATTEMPTS {
            if request.cancel.is_cancelled() {
                return Err(fail(FetchErrorKind::Cancelled, last_status, "cancelled".into()));
            }
            let now = Instant::now();
            if now >= request.deadline {
                return Err(fail(
                    FetchErrorKind::Timeout,
                    last_status,
                    "deadline exhausted".into(),
                ));
            }

            match self
                .buckets
                .acquire(&host, request.deadline, &request.cancel)
                .await
            {
                Ok(()) => {}
                Err(AcquireError::DeadlineExceeded) => {
                    return Err(fail(
                        FetchErrorKind::RateLimitTimeout,
                        last_status,
                        "no rate-limit token before deadline".into(),
                    ));
                }
                Err(AcquireError::Cancelled) => {
                    return Err(fail(FetchErrorKind::Cancelled, last_status, "cancelled".into()));
                }
            }

            let remaining = request.deadline.saturating_duration_since(Instant::now());
            let mut req = self
                .client
                .request(request.method.clone(), &request.url)
                .timeout(remaining);
            for (name, value) in &request.headers {
                req = req.header(name, value);
            }
            if let Some(body) = &request.body {
                req = req.body(body.clone());
            }

            match req.send().await {
                Err(e) => {
                    last_error = e.to_string();
                    let kind = if e.is_timeout() {
                        FetchErrorKind::Timeout
                    } else {
                        FetchErrorKind::Network
                    };
                    if attempt == MAX_ATTEMPTS {
                        return Err(fail(kind, last_status, last_error));
                    }
                    debug!(host = %host, attempt, error = %last_error, "retrying after network error");
                    retry_after = None;
                }
                Ok(resp) => {
                    let status = resp.status();
                    last_status = Some(status.as_u16());
                    retry_after = parse_retry_after(&resp);

                    if status.is_server_error() || status.as_u16() == 429 {
                        last_error = format!("HTTP {status}");
                        if attempt == MAX_ATTEMPTS {
                            return Err(fail(FetchErrorKind::Server, last_status, last_error));
                        }
                        debug!(host = %host, attempt, %status, "retrying after upstream status");
                    } else if !status.is_success() {
                        let body = read_capped(resp, request.size_cap).await.unwrap_or_default();
                        return Err(fail(
                            FetchErrorKind::Client,
                            last_status,
                            format!("HTTP {status}: {}", body_excerpt(&body)),
                        ));
                    } else {
                        let content_type = resp
                            .headers()
                            .get(reqwest::header::CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        match read_capped(resp, request.size_cap).await {
                            Ok(body) => {
                                return Ok(FetchResponse {
                                    status: status.as_u16(),
                                    content_type,
                                    body,
                                });
                            }
                            Err(ReadError::Oversize) => {
                                return Err(fail(
                                    FetchErrorKind::Oversize,
                                    last_status,
                                    format!("response exceeded {} bytes", request.size_cap),
                                ));
                            }
                            Err(ReadError::Network(msg)) => {
                                last_error = msg;
                                if attempt == MAX_ATTEMPTS {
                                    return Err(fail(
                                        FetchErrorKind::Network,
                                        last_status,
                                        last_error,
                                    ));
                                }
                            }
                        }
                    }
                }
            }

            let backoff = retry_after
                .take()
                .unwrap_or_else(|| backoff_with_jitter(attempt));
            let now = Instant::now();
            if now + backoff >= request.deadline {
                return Err(fail(FetchErrorKind::Timeout, last_status, last_error));
            }
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = request.cancel.cancelled() => {
                    return Err(fail(FetchErrorKind::Cancelled, last_status, "cancelled".into()));
                }
            }
        }

        Err(fail(FetchErrorKind::Network, last_status, last_error))
    }
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = BACKOFF_BASE
        .checked_mul(1u32 << (attempt - 1).min(4))
        .unwrap_or(BACKOFF_CAP)
        .min(BACKOFF_CAP);
    let jitter: f64 = rand::thread_rng().gen_range(0.8..=1.2);
    base.mul_f64(jitter)
}

/// `Retry-After` overrides the computed backoff for that attempt. Both the
/// seconds form and the HTTP-date form are accepted.
fn parse_retry_after(resp: &reqwest::Response) -> Option<Duration> {
    let value = resp.headers().get(reqwest::header::RETRY_AFTER)?;
    let value = value.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs.min(60)));
    }
    let date = time::OffsetDateTime::parse(
        value,
        &time::format_description::well_known::Rfc2822,
    )
    .ok()?;
    let now = time::OffsetDateTime::now_utc();
    let delta = date - now;
    if delta.is_positive() {
        Some(Duration::from_secs((delta.whole_seconds() as u64).min(60)))
    } else {
        Some(Duration::ZERO)
    }
}

enum ReadError {
    Oversize,
    Network(String),
}

async fn read_capped(mut resp: reqwest::Response, cap: usize) -> Result<Vec<u8>, ReadError> {
    if let Some(len) = resp.content_length()
        && len as usize > cap
    {
        return Err(ReadError::Oversize);
    }
    let mut body = Vec::new();
    loop {
        match resp.chunk().await {
            Ok(Some(chunk)) => {
                if body.len() + chunk.len() > cap {
                    return Err(ReadError::Oversize);
                }
                body.extend_from_slice(&chunk);
            }
            Ok(None) => return Ok(body),
            Err(e) => return Err(ReadError::Network(e.to_string())),
        }
    }
}

/// First few hundred bytes of a body, lossily decoded, for error messages.
pub fn body_excerpt(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(&body[..body.len().min(300)]);
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway() -> Arc<Gateway> {
        let mut config = GatewayConfig::new("litmcp-test".into());
        config.policies = HashMap::new();
        Arc::new(Gateway::new(config).unwrap())
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[tokio::test]
    async fn success_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&server)
            .await;

        let gw = gateway();
        let resp = gw
            .fetch(FetchRequest::get(format!("{}/ok", server.uri())).deadline(far_deadline()))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"hello");
    }

    #[tokio::test]
    async fn server_errors_are_retried_then_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky5xx"))
            .respond_with(ResponseTemplate::new(500))
            .expect(5)
            .mount(&server)
            .await;

        let gw = gateway();
        let err = gw
            .fetch(
                FetchRequest::get(format!("{}/flaky5xx", server.uri()))
                    .deadline(Instant::now() + Duration::from_secs(120)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Server);
        assert_eq!(err.last_status, Some(500));
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nope"))
            .respond_with(ResponseTemplate::new(404).set_body_string("missing"))
            .expect(1)
            .mount(&server)
            .await;

        let gw = gateway();
        let err = gw
            .fetch(FetchRequest::get(format!("{}/nope", server.uri())).deadline(far_deadline()))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Client);
        assert_eq!(err.last_status, Some(404));
        assert!(err.message.contains("missing"));
    }

    #[tokio::test]
    async fn oversize_body_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/big"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 4096]))
            .mount(&server)
            .await;

        let gw = gateway();
        let err = gw
            .fetch(
                FetchRequest::get(format!("{}/big", server.uri()))
                    .size_cap(1024)
                    .deadline(far_deadline()),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Oversize);
    }

    #[tokio::test]
    async fn cancelled_token_aborts_before_send() {
        let server = MockServer::start().await;
        let gw = gateway();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = gw
            .fetch(
                FetchRequest::get(format!("{}/any", server.uri()))
                    .cancel_token(cancel)
                    .deadline(far_deadline()),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn body_excerpt_collapses_whitespace() {
        assert_eq!(body_excerpt(b"a  b\n\nc"), "a b c");
    }
}
