use std::sync::Arc;
use std::time::Duration;

use axum::body::Body as AxumBody;
use axum::http::{Request, Response, StatusCode, header};
use axum::response::IntoResponse;
use http_body_util::BodyExt;
use tokio::time::sleep;

use crate::ports::directory::BackendDirectory;
use crate::ports::http_client::{BackendBody, BackendClient};

/// Client-visible body for every upstream failure. Non-200 backend statuses
/// and unreachable backends share it on purpose; only the logs distinguish
/// them.
const BAD_GATEWAY_BODY: &str = "502 - Bad Gateway";
const NOT_FOUND_BODY: &str = "404 - Domain not found";

/// Bounded retry parameters for one forwarded request.
///
/// Backoff is `base_delay * 2^(attempt-1)` between attempts, no jitter, no
/// cap beyond the attempt count.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.pow(attempt - 1)
    }
}

/// Hostname-routed forwarding: directory lookup, bounded-retry fetch, relay.
///
/// One instance serves every request on the TLS listener; per-request state
/// lives on the handler task's stack.
pub struct ForwardingPipeline {
    directory: Arc<dyn BackendDirectory>,
    client: Arc<dyn BackendClient>,
    retry: RetryPolicy,
}

impl ForwardingPipeline {
    pub fn new(directory: Arc<dyn BackendDirectory>, client: Arc<dyn BackendClient>) -> Self {
        Self {
            directory,
            client,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Handle one incoming request end to end.
    ///
    /// Every failure kind is absorbed here: the client only ever sees a
    /// standard status line with a short plaintext body.
    pub async fn handle(&self, req: Request<AxumBody>) -> Response<AxumBody> {
        let Some(host) = request_host(&req).map(str::to_owned) else {
            tracing::info!(stage = "lookup", outcome = "no_host", "request without a host");
            return (StatusCode::NOT_FOUND, NOT_FOUND_BODY).into_response();
        };

        let record = match self.directory.lookup(&host).await {
            Ok(Some(record)) => {
                tracing::info!(
                    hostname = %host,
                    stage = "lookup",
                    outcome = "found",
                    backend_url = %record.backend_url,
                    "resolved backend"
                );
                record
            }
            Ok(None) => {
                // Expected traffic for unprovisioned domains, not an error
                tracing::info!(hostname = %host, stage = "lookup", outcome = "not_found", "no directory record");
                return (StatusCode::NOT_FOUND, NOT_FOUND_BODY).into_response();
            }
            Err(err) => {
                tracing::error!(
                    hostname = %host,
                    stage = "lookup",
                    outcome = "unavailable",
                    error = %err,
                    "directory lookup failed"
                );
                return (StatusCode::BAD_GATEWAY, BAD_GATEWAY_BODY).into_response();
            }
        };

        let response = match self.fetch_with_retry(&host, &record.backend_url).await {
            Some(response) => response,
            None => {
                tracing::error!(
                    hostname = %host,
                    stage = "fetch",
                    outcome = "exhausted",
                    attempts = self.retry.max_attempts,
                    backend_url = %record.backend_url,
                    "all backend attempts failed"
                );
                return (StatusCode::BAD_GATEWAY, BAD_GATEWAY_BODY).into_response();
            }
        };

        if response.status() != StatusCode::OK {
            tracing::warn!(
                hostname = %host,
                stage = "validate",
                outcome = "bad_status",
                status = response.status().as_u16(),
                backend_url = %record.backend_url,
                "backend returned non-200 status"
            );
            return (StatusCode::BAD_GATEWAY, BAD_GATEWAY_BODY).into_response();
        }

        tracing::info!(hostname = %host, stage = "relay", outcome = "ok", "relaying backend response");
        relay(host, response)
    }

    /// Up to `max_attempts` GETs against the backend; only transport errors
    /// retry. Returns `None` once every attempt has failed.
    async fn fetch_with_retry(&self, host: &str, url: &str) -> Option<http::Response<BackendBody>> {
        for attempt in 1..=self.retry.max_attempts {
            match self.client.get(url).await {
                Ok(response) => return Some(response),
                Err(err) => {
                    tracing::warn!(
                        hostname = %host,
                        stage = "fetch",
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        error = %err,
                        "backend attempt failed"
                    );
                    if attempt < self.retry.max_attempts {
                        let backoff = self.retry.backoff(attempt);
                        tracing::debug!(hostname = %host, stage = "fetch", backoff_ms = backoff.as_millis() as u64, "backing off before retry");
                        sleep(backoff).await;
                    }
                }
            }
        }
        None
    }
}

/// Routing key extraction: the Host header, falling back to the request
/// URI's authority (HTTP/2 requests surface `:authority` there).
fn request_host<B>(req: &Request<B>) -> Option<&str> {
    req.headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| req.uri().host())
        .filter(|host| !host.is_empty())
}

/// Stream the committed 200 response back to the client.
///
/// Headers are copied verbatim, multi-valued names appended in order. The
/// body is handed over as a stream; a copy failure partway through is logged
/// and the connection closes, because status and headers are already on the
/// wire.
fn relay(host: String, response: http::Response<BackendBody>) -> Response<AxumBody> {
    let (parts, body) = response.into_parts();

    let body = body.map_err(move |err| {
        tracing::error!(
            hostname = %host,
            stage = "relay",
            outcome = "copy_failed",
            error = %err,
            "error copying response body"
        );
        axum::BoxError::from(err)
    });

    let mut out = Response::new(AxumBody::new(body));
    *out.status_mut() = StatusCode::OK;
    for (name, value) in parts.headers.iter() {
        out.headers_mut().append(name, value.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::directory::{
        BackendRecord, DirectoryError, HostnamesFuture, LookupFuture, strip_port,
    };
    use crate::ports::http_client::{FetchError, FetchFuture, FetchResult};
    use bytes::Bytes;
    use http_body_util::Full;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MapDirectory {
        records: HashMap<String, BackendRecord>,
        fail: bool,
    }

    impl MapDirectory {
        fn with_record(hostname: &str, backend_url: &str) -> Self {
            let record = BackendRecord {
                id: 1,
                hostname: hostname.to_string(),
                backend_url: backend_url.to_string(),
            };
            Self {
                records: HashMap::from([(hostname.to_string(), record)]),
                fail: false,
            }
        }

        fn empty() -> Self {
            Self {
                records: HashMap::new(),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                records: HashMap::new(),
                fail: true,
            }
        }
    }

    impl BackendDirectory for MapDirectory {
        fn lookup<'a>(&'a self, hostname: &'a str) -> LookupFuture<'a> {
            Box::pin(async move {
                if self.fail {
                    return Err(DirectoryError::QueryFailed("connection refused".into()));
                }
                Ok(self.records.get(strip_port(hostname)).cloned())
            })
        }

        fn hostnames<'a>(&'a self) -> HostnamesFuture<'a> {
            Box::pin(async move { Ok(self.records.keys().cloned().collect()) })
        }
    }

    struct ScriptedClient {
        responses: Mutex<Vec<FetchResult>>,
        calls: AtomicU32,
    }

    impl ScriptedClient {
        fn new(responses: Vec<FetchResult>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl BackendClient for ScriptedClient {
        fn get<'a>(&'a self, _url: &'a str) -> FetchFuture<'a> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            let next = if responses.is_empty() {
                Err(FetchError::Connection("script exhausted".into()))
            } else {
                responses.remove(0)
            };
            Box::pin(async move { next })
        }
    }

    fn backend_response(status: StatusCode, body: &str) -> http::Response<BackendBody> {
        http::Response::builder()
            .status(status)
            .body(
                Full::new(Bytes::from(body.to_owned()))
                    .map_err(|err| std::io::Error::other(err))
                    .boxed(),
            )
            .unwrap()
    }

    fn request_for(host: &str) -> Request<AxumBody> {
        Request::builder()
            .uri("/status")
            .header(header::HOST, host)
            .body(AxumBody::empty())
            .unwrap()
    }

    async fn body_bytes(response: Response<AxumBody>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn test_unknown_host_is_404_without_fetching() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let pipeline = ForwardingPipeline::new(Arc::new(MapDirectory::empty()), client.clone());

        let response = pipeline.handle(request_for("nobody.example.com")).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_bytes(response).await, NOT_FOUND_BODY.as_bytes());
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_directory_failure_is_502_without_fetching() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let pipeline = ForwardingPipeline::new(Arc::new(MapDirectory::failing()), client.clone());

        let response = pipeline.handle(request_for("status.acme.com")).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_bytes(response).await, BAD_GATEWAY_BODY.as_bytes());
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failures_retry_with_backoff_then_succeed() {
        let client = Arc::new(ScriptedClient::new(vec![
            Err(FetchError::Connection("refused".into())),
            Err(FetchError::Timeout(Duration::from_secs(30))),
            Ok(backend_response(StatusCode::OK, "third time lucky")),
        ]));
        let directory = MapDirectory::with_record("status.acme.com", "http://backend:9000/page");
        let pipeline = ForwardingPipeline::new(Arc::new(directory), client.clone());

        let started = tokio::time::Instant::now();
        let response = pipeline.handle(request_for("status.acme.com")).await;
        let elapsed = started.elapsed();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, "third time lucky".as_bytes());
        assert_eq!(client.calls(), 3);
        // Two backoff sleeps: 100ms then 200ms (time is paused, so elapsed
        // is exactly the slept amount)
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_success_relays_headers_and_body_verbatim() {
        let response = http::Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/html")
            .header("set-cookie", "a=1")
            .header("set-cookie", "b=2")
            .body(
                Full::new(Bytes::from_static(b"<html>status</html>"))
                    .map_err(|err| std::io::Error::other(err))
                    .boxed(),
            )
            .unwrap();
        let client = Arc::new(ScriptedClient::new(vec![Ok(response)]));
        let directory = MapDirectory::with_record("status.acme.com", "http://backend:9000/page");
        let pipeline = ForwardingPipeline::new(Arc::new(directory), client.clone());

        let response = pipeline.handle(request_for("status.acme.com")).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(client.calls(), 1);
        let cookies: Vec<_> = response
            .headers()
            .get_all("set-cookie")
            .iter()
            .map(|value| value.to_str().unwrap().to_owned())
            .collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/html"
        );
        assert_eq!(body_bytes(response).await, &b"<html>status</html>"[..]);
    }

    #[tokio::test]
    async fn test_non_200_status_is_502_without_retrying() {
        for status in [StatusCode::INTERNAL_SERVER_ERROR, StatusCode::MOVED_PERMANENTLY] {
            let client = Arc::new(ScriptedClient::new(vec![Ok(backend_response(
                status, "upstream",
            ))]));
            let directory =
                MapDirectory::with_record("status.acme.com", "http://backend:9000/page");
            let pipeline = ForwardingPipeline::new(Arc::new(directory), client.clone());

            let response = pipeline.handle(request_for("status.acme.com")).await;

            assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
            assert_eq!(body_bytes(response).await, BAD_GATEWAY_BODY.as_bytes());
            assert_eq!(client.calls(), 1, "non-200 ({status}) must not retry");
        }
    }

    #[tokio::test]
    async fn test_all_attempts_exhausted_is_502() {
        let client = Arc::new(ScriptedClient::new(vec![
            Err(FetchError::Connection("refused".into())),
            Err(FetchError::Connection("refused".into())),
            Err(FetchError::Connection("refused".into())),
        ]));
        let directory = MapDirectory::with_record("status.acme.com", "http://backend:9000/page");
        let pipeline = ForwardingPipeline::new(Arc::new(directory), client.clone());

        let response = pipeline.handle(request_for("status.acme.com")).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn test_host_with_port_reaches_the_same_record() {
        let directory = MapDirectory::with_record("status.acme.com", "http://backend:9000/page");
        let directory = Arc::new(directory);

        for host in ["status.acme.com", "status.acme.com:443"] {
            let client = Arc::new(ScriptedClient::new(vec![Ok(backend_response(
                StatusCode::OK,
                "ok",
            ))]));
            let pipeline = ForwardingPipeline::new(directory.clone(), client.clone());
            let response = pipeline.handle(request_for(host)).await;
            assert_eq!(response.status(), StatusCode::OK, "host {host}");
            assert_eq!(client.calls(), 1);
        }
    }

    #[tokio::test]
    async fn test_missing_host_is_404() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let pipeline = ForwardingPipeline::new(Arc::new(MapDirectory::empty()), client.clone());

        let request = Request::builder()
            .uri("/status")
            .body(AxumBody::empty())
            .unwrap();
        let response = pipeline.handle(request).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(client.calls(), 0);
    }
}
