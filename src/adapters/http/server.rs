use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use axum::Router;
use axum::body::Body as AxumBody;
use axum::extract::{Path, State};
use axum::http::{Request, StatusCode, header};
use axum::response::{IntoResponse, Response as AxumResponse};
use axum::routing::get;
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::config::Settings;
use crate::core::pipeline::ForwardingPipeline;
use crate::core::resolver::CertResolver;
use crate::ports::certificates::CertificateObtainer;
use crate::ports::directory::strip_port;
use crate::utils::graceful_shutdown::GracefulShutdown;

const READY_BODY: &str = "Service is ready";

/// The three edge listeners and their lifecycle.
///
/// The plaintext listener answers readiness probes, serves HTTP-01
/// challenge probes out of the obtainer, and redirects everything else to
/// HTTPS. The TLS listener terminates TLS with the certificate resolver and
/// hands requests to the forwarding pipeline. The health listener serves
/// only the readiness probe, isolated from TLS and backend reachability.
pub struct EdgeServer {
    settings: Arc<Settings>,
    pipeline: Arc<ForwardingPipeline>,
    resolver: Arc<CertResolver>,
    obtainer: Arc<dyn CertificateObtainer>,
    shutdown: Arc<GracefulShutdown>,
}

impl EdgeServer {
    pub fn new(
        settings: Arc<Settings>,
        pipeline: Arc<ForwardingPipeline>,
        resolver: Arc<CertResolver>,
        obtainer: Arc<dyn CertificateObtainer>,
        shutdown: Arc<GracefulShutdown>,
    ) -> Self {
        Self {
            settings,
            pipeline,
            resolver,
            obtainer,
            shutdown,
        }
    }

    /// Bind and serve all three listeners until shutdown.
    ///
    /// The plaintext listener comes up first: certificate issuance on the
    /// TLS listener depends on it answering challenge probes. On shutdown
    /// the order reverses priority: health drains first so load balancers
    /// stop routing here, then plaintext, then TLS. A TLS listener that
    /// cannot stop cleanly is a fatal error; the other two are reported.
    pub async fn run(&self) -> Result<()> {
        let plaintext_handle = Handle::new();
        let mut plaintext_task = spawn_plain(
            self.settings.http_addr(),
            plaintext_router(self.obtainer.clone()),
            plaintext_handle.clone(),
        );
        wait_listening("plaintext", &plaintext_handle, &mut plaintext_task).await?;

        let health_handle = Handle::new();
        let mut health_task = spawn_plain(
            self.settings.health_addr(),
            health_router(),
            health_handle.clone(),
        );
        wait_listening("health", &health_handle, &mut health_task).await?;

        let tls_config = self.tls_config()?;
        let tls_handle = Handle::new();
        let mut tls_task = spawn_tls(
            self.settings.https_addr(),
            tls_router(self.pipeline.clone()),
            tls_config,
            tls_handle.clone(),
        );
        wait_listening("tls", &tls_handle, &mut tls_task).await?;

        tracing::info!("all listeners ready");

        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::select! {
            reason = shutdown_rx.recv() => {
                match reason {
                    Ok(reason) => tracing::info!("shutdown initiated: {:?}", reason),
                    Err(_) => tracing::warn!("shutdown channel closed, stopping listeners"),
                }
            }
            result = &mut tls_task => {
                return Err(task_error("tls", result)).context("TLS listener terminated unexpectedly");
            }
        }

        let grace = self.settings.shutdown_grace();
        if let Err(err) = drain("health", health_handle, health_task, grace).await {
            tracing::warn!("could not gracefully shut down the health listener: {err:#}");
        }
        if let Err(err) = drain("plaintext", plaintext_handle, plaintext_task, grace).await {
            tracing::warn!("could not gracefully shut down the plaintext listener: {err:#}");
        }
        drain("tls", tls_handle, tls_task, grace)
            .await
            .context("could not gracefully shut down the TLS listener")?;

        tracing::info!("all listeners stopped");
        Ok(())
    }

    /// TLS acceptance config with the resolver as the per-handshake
    /// certificate callback. The crypto provider is installed once in main.
    fn tls_config(&self) -> Result<RustlsConfig> {
        let mut server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(self.resolver.clone());
        server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Ok(RustlsConfig::from_config(Arc::new(server_config)))
    }
}

fn spawn_plain(addr: SocketAddr, router: Router, handle: Handle) -> JoinHandle<std::io::Result<()>> {
    tokio::spawn(async move {
        axum_server::bind(addr)
            .handle(handle)
            .serve(router.into_make_service())
            .await
    })
}

fn spawn_tls(
    addr: SocketAddr,
    router: Router,
    tls_config: RustlsConfig,
    handle: Handle,
) -> JoinHandle<std::io::Result<()>> {
    tokio::spawn(async move {
        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(router.into_make_service())
            .await
    })
}

/// Resolve the listening address or surface the bind failure.
async fn wait_listening(
    name: &str,
    handle: &Handle,
    task: &mut JoinHandle<std::io::Result<()>>,
) -> Result<SocketAddr> {
    match handle.listening().await {
        Some(addr) => {
            tracing::info!(listener = name, %addr, "listener ready");
            Ok(addr)
        }
        None => {
            let result = task.await;
            Err(task_error(name, result)).with_context(|| format!("failed to start {name} listener"))
        }
    }
}

fn task_error(name: &str, result: Result<std::io::Result<()>, tokio::task::JoinError>) -> anyhow::Error {
    match result {
        Ok(Ok(())) => anyhow!("{name} listener exited unexpectedly"),
        Ok(Err(err)) => anyhow!(err),
        Err(err) => anyhow!(err),
    }
}

/// Stop accepting, give in-flight requests the grace period, await the task.
async fn drain(
    name: &str,
    handle: Handle,
    task: JoinHandle<std::io::Result<()>>,
    grace: Duration,
) -> Result<()> {
    handle.graceful_shutdown(Some(grace));
    match task.await {
        Ok(Ok(())) => {
            tracing::info!(listener = name, "listener stopped");
            Ok(())
        }
        Ok(Err(err)) => Err(anyhow!(err)),
        Err(err) => Err(anyhow!(err)),
    }
}

/// Readiness probes, challenge delegation, HTTPS redirect.
fn plaintext_router(obtainer: Arc<dyn CertificateObtainer>) -> Router {
    Router::new()
        .route("/ready", get(ready))
        .route("/.well-known/acme-challenge/{token}", get(challenge))
        .fallback(redirect_to_https)
        .with_state(obtainer)
        .layer(TraceLayer::new_for_http())
}

/// Readiness only, so liveness never depends on TLS or backends.
fn health_router() -> Router {
    Router::new()
        .route("/ready", get(ready))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .layer(TraceLayer::new_for_http())
}

/// Every request not matched by a route goes through the pipeline.
fn tls_router(pipeline: Arc<ForwardingPipeline>) -> Router {
    Router::new()
        .fallback(move |req: Request<AxumBody>| {
            let pipeline = pipeline.clone();
            async move { pipeline.handle(req).await }
        })
        .layer(TraceLayer::new_for_http())
}

async fn ready() -> &'static str {
    READY_BODY
}

async fn challenge(
    State(obtainer): State<Arc<dyn CertificateObtainer>>,
    Path(token): Path<String>,
) -> AxumResponse {
    match obtainer.challenge_response(&token) {
        Some(key_authorization) => {
            tracing::info!(token = %token, "answering HTTP challenge probe");
            key_authorization.into_response()
        }
        None => {
            tracing::debug!(token = %token, "unknown challenge token");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

/// 302 to the HTTPS equivalent: same host and path, query preserved. A port
/// in the incoming Host is dropped so the redirect lands on the TLS
/// listener's standard port.
async fn redirect_to_https(req: Request<AxumBody>) -> AxumResponse {
    let Some(host) = req
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| req.uri().host())
    else {
        return (StatusCode::BAD_REQUEST, "missing Host header").into_response();
    };

    let host = strip_port(host);
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let location = format!("https://{host}{path_and_query}");

    tracing::debug!(%location, "redirecting plaintext request to HTTPS");
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::certificates::ObtainError;
    use http_body_util::BodyExt;
    use rustls::sign::CertifiedKey;
    use tower::util::ServiceExt;

    struct TableObtainer {
        tokens: Vec<(String, String)>,
    }

    impl CertificateObtainer for TableObtainer {
        fn obtain(&self, server_name: &str) -> Result<Arc<CertifiedKey>, ObtainError> {
            Err(ObtainError::NotAllowed(server_name.to_string()))
        }

        fn challenge_response(&self, token: &str) -> Option<String> {
            self.tokens
                .iter()
                .find(|(known, _)| known == token)
                .map(|(_, response)| response.clone())
        }
    }

    fn test_plaintext_router() -> Router {
        plaintext_router(Arc::new(TableObtainer {
            tokens: vec![("token-1".to_string(), "token-1.auth".to_string())],
        }))
    }

    async fn body_string(response: AxumResponse) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_plaintext_ready_probe() {
        let response = test_plaintext_router()
            .oneshot(
                Request::builder()
                    .uri("/ready")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, READY_BODY);
    }

    #[tokio::test]
    async fn test_plaintext_serves_known_challenge() {
        let response = test_plaintext_router()
            .oneshot(
                Request::builder()
                    .uri("/.well-known/acme-challenge/token-1")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "token-1.auth");
    }

    #[tokio::test]
    async fn test_plaintext_unknown_challenge_is_404() {
        let response = test_plaintext_router()
            .oneshot(
                Request::builder()
                    .uri("/.well-known/acme-challenge/token-9")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_plaintext_redirects_everything_else_to_https() {
        let response = test_plaintext_router()
            .oneshot(
                Request::builder()
                    .uri("/status/page?tab=history")
                    .header(header::HOST, "status.acme.com:8080")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://status.acme.com/status/page?tab=history"
        );
    }

    #[tokio::test]
    async fn test_plaintext_redirect_without_host_is_rejected() {
        let response = test_plaintext_router()
            .oneshot(
                Request::builder()
                    .uri("/anything")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_router_only_answers_ready() {
        let router = health_router();

        let ready = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/ready")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(ready.status(), StatusCode::OK);
        assert_eq!(body_string(ready).await, READY_BODY);

        let other = router
            .oneshot(
                Request::builder()
                    .uri("/status")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(other.status(), StatusCode::NOT_FOUND);
    }
}
