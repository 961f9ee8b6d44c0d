use std::sync::Arc;

use rustls::sign::CertifiedKey;
use thiserror::Error;

/// Error type for certificate acquisition.
///
/// None of these reach a TLS client: the resolver downgrades every failure
/// to its self-signed fallback certificate instead of aborting the
/// handshake.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ObtainError {
    /// The hostname is not on the issuance allow-list
    #[error("hostname {0:?} is not eligible for certificate issuance")]
    NotAllowed(String),

    /// The validation flow with the certificate authority failed
    #[error("certificate issuance failed: {0}")]
    Issuance(String),

    /// The on-disk certificate cache could not be read or written
    #[error("certificate cache error: {0}")]
    Cache(String),
}

/// CertificateObtainer defines the port for acquiring a served-name
/// certificate and for answering the HTTP challenges that issuance depends
/// on.
///
/// `obtain` is synchronous because it is consumed from inside the TLS
/// handshake callback, which rustls invokes synchronously; implementations
/// that need to perform network I/O bridge to the async runtime internally.
pub trait CertificateObtainer: Send + Sync + 'static {
    /// Produce a certificate for the given server name, consulting the
    /// obtainer's own cache first.
    ///
    /// # Arguments
    /// * `server_name` - The SNI name announced by the TLS client
    fn obtain(&self, server_name: &str) -> Result<Arc<CertifiedKey>, ObtainError>;

    /// Answer an HTTP-01 challenge probe.
    ///
    /// # Arguments
    /// * `token` - The token path segment of `/.well-known/acme-challenge/{token}`
    ///
    /// # Returns
    /// The key authorization body for an in-flight challenge, or `None` when
    /// the token is unknown
    fn challenge_response(&self, token: &str) -> Option<String>;
}
