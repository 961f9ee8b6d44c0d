pub mod certificates;
pub mod directory;
pub mod http_client;
