//! The Wharf registry server.
//!
//! Wires the registry v2 API, the ingest/replication processor and the
//! janitor's background sweeps on top of the metadata store and a storage
//! driver.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod janitor;
pub mod metrics;
pub mod processor;
pub mod routes;
pub mod scanner;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use janitor::Janitor;
pub use processor::Processor;
pub use routes::create_router;
pub use state::AppState;

/// Value of the mandatory API version header.
pub const API_VERSION_HEADER: &str = "Docker-Distribution-Api-Version";
pub const API_VERSION_VALUE: &str = "registry/2.0";
