/// Frontdoor - a hostname-routed TLS reverse proxy
///
/// This crate provides a reverse proxy that:
/// - Terminates TLS for many domains with per-handshake certificate resolution
/// - Resolves hostnames to backend URLs through a Postgres-backed directory
/// - Relays backend responses with bounded retry and backoff
/// - Serves domain-validation HTTP challenges and redirects plaintext to HTTPS
// Re-export public modules with explicit visibility controls
pub mod config;
pub mod ports;
pub mod tracing_setup;

// These modules are implementation details and should not be directly used by users
pub(crate) mod adapters;
pub(crate) mod core;
pub(crate) mod utils;

// Re-export the specific types needed by the binary crate
pub use crate::adapters::acme::AcmeObtainer;
pub use crate::adapters::http::server::EdgeServer;
pub use crate::adapters::http_client::HyperBackendClient;
pub use crate::adapters::postgres::PostgresDirectory;
pub use crate::core::pipeline::{ForwardingPipeline, RetryPolicy};
pub use crate::core::resolver::CertResolver;
pub use crate::utils::graceful_shutdown::{GracefulShutdown, ShutdownReason};
