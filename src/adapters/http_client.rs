use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::time::timeout;

use crate::ports::http_client::{BackendClient, FetchError, FetchFuture};

type HttpsConnector = hyper_rustls::HttpsConnector<HttpConnector>;

const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTPS-capable backend fetcher built on the hyper connection pool.
///
/// One instance is shared by every request; the per-attempt timeout is
/// applied here so the retry loop upstream only ever sees transport
/// outcomes.
pub struct HyperBackendClient {
    client: Client<HttpsConnector, Empty<Bytes>>,
    attempt_timeout: Duration,
}

impl HyperBackendClient {
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_ATTEMPT_TIMEOUT)
    }

    pub fn with_timeout(attempt_timeout: Duration) -> Result<Self> {
        let mut roots = rustls::RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs()
            .context("failed to load native root certificates")?;
        let (added, ignored) = roots.add_parsable_certificates(native);
        if ignored > 0 {
            tracing::warn!(added, ignored, "some native root certificates were unparseable");
        }

        let tls = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .build();

        let client = Client::builder(TokioExecutor::new()).build(connector);

        tracing::info!("created HTTPS-capable backend client");
        Ok(Self {
            client,
            attempt_timeout,
        })
    }
}

impl BackendClient for HyperBackendClient {
    fn get<'a>(&'a self, url: &'a str) -> FetchFuture<'a> {
        Box::pin(async move {
            let uri: Uri = url.parse().map_err(|err: http::uri::InvalidUri| {
                FetchError::InvalidUrl {
                    url: url.to_string(),
                    reason: err.to_string(),
                }
            })?;

            let request = Request::builder()
                .method(Method::GET)
                .uri(uri.clone())
                .body(Empty::<Bytes>::new())
                .map_err(|err| FetchError::InvalidUrl {
                    url: url.to_string(),
                    reason: err.to_string(),
                })?;

            tracing::debug!(url = %uri, "fetching from backend");

            match timeout(self.attempt_timeout, self.client.request(request)).await {
                Ok(Ok(response)) => {
                    tracing::debug!(url = %uri, status = response.status().as_u16(), "backend responded");
                    Ok(response.map(|body| body.map_err(std::io::Error::other).boxed()))
                }
                Ok(Err(err)) => Err(FetchError::Connection(err.to_string())),
                Err(_) => Err(FetchError::Timeout(self.attempt_timeout)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install_crypto_provider() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }

    #[tokio::test]
    async fn test_unparseable_url_is_invalid_url() {
        install_crypto_provider();
        let client = HyperBackendClient::new().unwrap();

        let err = client.get("not a url").await.unwrap_err();

        assert!(matches!(err, FetchError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn test_refused_connection_is_a_connection_error() {
        install_crypto_provider();
        let client = HyperBackendClient::with_timeout(Duration::from_secs(5)).unwrap();

        // Nothing listens on the discard port locally
        let err = client.get("http://127.0.0.1:9/").await.unwrap_err();

        assert!(matches!(err, FetchError::Connection(_)));
    }
}
