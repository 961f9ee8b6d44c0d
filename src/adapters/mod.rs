pub mod acme;
pub mod http;
pub mod http_client;
pub mod postgres;

pub use acme::AcmeObtainer;
pub use http_client::HyperBackendClient;
pub use postgres::PostgresDirectory;
