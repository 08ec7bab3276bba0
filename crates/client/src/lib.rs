//! Outbound registry client.
//!
//! Used by the replication path to talk to an upstream peer, and by
//! verification tooling to recursively validate manifests and blobs.

pub mod error;
pub mod repo_client;
pub mod validate;

pub use error::{ClientError, ClientResult};
pub use repo_client::RepoClient;
pub use validate::ValidationSession;
