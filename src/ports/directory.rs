use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// One row of the hostname directory. Owned by the caller for the duration
/// of a single request and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRecord {
    pub id: i32,
    pub hostname: String,
    pub backend_url: String,
}

/// Error type for directory lookups.
///
/// A missing row is NOT an error: `lookup` reports it as `Ok(None)`. This
/// variant set only covers the storage layer actually failing, which callers
/// must surface as "upstream unavailable" rather than "unknown domain".
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DirectoryError {
    /// The underlying storage rejected or failed the query
    #[error("directory query failed: {0}")]
    QueryFailed(String),

    /// A row existed but could not be decoded into a record
    #[error("malformed directory row: {0}")]
    MalformedRow(String),
}

/// Result type alias for directory lookups: `Ok(Some(_))` found,
/// `Ok(None)` no record for that hostname, `Err(_)` storage failure.
pub type DirectoryResult = Result<Option<BackendRecord>, DirectoryError>;

/// Type alias for async lookup responses
pub type LookupFuture<'a> = Pin<Box<dyn Future<Output = DirectoryResult> + Send + 'a>>;

/// Type alias for async hostname enumeration responses
pub type HostnamesFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<String>, DirectoryError>> + Send + 'a>>;

/// BackendDirectory defines the port (interface) for resolving hostnames to
/// backend targets.
pub trait BackendDirectory: Send + Sync + 'static {
    /// Look up the backend record for a hostname.
    ///
    /// Implementations strip an optional `:port` suffix before matching and
    /// match the remainder exactly as stored (no wildcard or suffix rules).
    ///
    /// # Arguments
    /// * `hostname` - The request's host, possibly carrying a port suffix
    ///
    /// # Returns
    /// A future resolving to the record, `None` when no record exists, or a
    /// `DirectoryError` when the storage layer failed
    fn lookup<'a>(&'a self, hostname: &'a str) -> LookupFuture<'a>;

    /// Enumerate every hostname in the directory.
    ///
    /// Used once at startup to seed the certificate issuance allow-list.
    fn hostnames<'a>(&'a self) -> HostnamesFuture<'a>;
}

/// Strip an optional port suffix from a host string.
///
/// `"status.acme.com:443"` and `"status.acme.com"` both yield
/// `"status.acme.com"`; a bracketed IPv6 literal loses its brackets along
/// with the port. A string without a valid numeric port is returned
/// unmodified rather than treated as an error.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
        return host;
    }

    match host.rfind(':') {
        Some(idx) => {
            let port = &host[idx + 1..];
            if !port.is_empty()
                && port.bytes().all(|b| b.is_ascii_digit())
                && !host[..idx].contains(':')
            {
                &host[..idx]
            } else {
                host
            }
        }
        None => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_port_removes_suffix() {
        assert_eq!(strip_port("status.acme.com:443"), "status.acme.com");
        assert_eq!(strip_port("localhost:8080"), "localhost");
    }

    #[test]
    fn test_strip_port_idempotent_without_port() {
        assert_eq!(strip_port("status.acme.com"), "status.acme.com");
        assert_eq!(
            strip_port(strip_port("status.acme.com:443")),
            "status.acme.com"
        );
    }

    #[test]
    fn test_strip_port_ipv6() {
        assert_eq!(strip_port("[::1]:443"), "::1");
        assert_eq!(strip_port("[2001:db8::1]"), "2001:db8::1");
    }

    #[test]
    fn test_strip_port_leaves_odd_input_alone() {
        // Not a port, so the original string is used unmodified
        assert_eq!(strip_port("host:name:odd"), "host:name:odd");
        assert_eq!(strip_port("host:"), "host:");
        assert_eq!(strip_port("host:8a"), "host:8a");
        assert_eq!(strip_port(""), "");
    }
}
