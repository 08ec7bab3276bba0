//! Metadata store for the Wharf registry.
//!
//! All persistent registry state except object contents lives here: accounts,
//! repositories, blobs and their mounts, manifests and their reference
//! graphs, tags, upload sessions and quotas. The database is the source of
//! truth; storage inconsistencies are only ever tolerated in the direction
//! "present in storage but absent in the database".

pub mod error;
pub mod models;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use store::{IngestTx, MetadataStore, SqliteStore};
