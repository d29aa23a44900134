pub mod canonical;
pub mod config;
pub mod emit;
pub mod error;
pub mod http;
pub mod ingest;
pub mod metrics_server;
pub mod observability;
pub mod report;
pub mod signing;
pub mod validation;

pub use http::{router, AppState};
pub use signing::Signer;
