use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use http::Response;
use http_body_util::combinators::BoxBody;
use thiserror::Error;

/// Response body type at the backend-fetch boundary.
///
/// Boxed so adapters can hand back a live streaming body while test doubles
/// fabricate buffered ones.
pub type BackendBody = BoxBody<Bytes, std::io::Error>;

/// Custom error type for backend fetch operations.
///
/// Only transport-level failures live here. A completed HTTP exchange is a
/// success at this boundary regardless of status code; judging the status is
/// the caller's job.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FetchError {
    /// Error when connection to the backend fails
    #[error("connection error: {0}")]
    Connection(String),

    /// Error when the attempt exceeds the per-attempt deadline
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Error when the backend URL cannot be parsed
    #[error("invalid backend URL {url:?}: {reason}")]
    InvalidUrl {
        /// The URL that failed to parse
        url: String,
        /// Why it failed to parse
        reason: String,
    },
}

/// Result type alias for backend fetch operations
pub type FetchResult = Result<Response<BackendBody>, FetchError>;

/// Type alias for async backend fetch responses
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = FetchResult> + Send + 'a>>;

/// BackendClient defines the port (interface) for fetching content from
/// backend servers.
pub trait BackendClient: Send + Sync + 'static {
    /// Perform a GET against a backend URL.
    ///
    /// Implementations apply the fixed per-attempt timeout; retries are the
    /// caller's concern.
    ///
    /// # Arguments
    /// * `url` - The absolute backend URL to fetch
    ///
    /// # Returns
    /// A future that resolves to the backend's response (whatever its
    /// status) or a transport-level `FetchError`
    fn get<'a>(&'a self, url: &'a str) -> FetchFuture<'a>;
}
