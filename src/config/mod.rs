pub mod models;

pub use models::{AcmeConfig, Settings};
