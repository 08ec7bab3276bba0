//! Repository traits for the metadata store.

pub mod accounts;
pub mod blobs;
pub mod manifests;
pub mod repositories;
pub mod tags;
pub mod uploads;

pub use accounts::AccountRepo;
pub use blobs::BlobRepo;
pub use manifests::ManifestRepo;
pub use repositories::RepositoryRepo;
pub use tags::TagRepo;
pub use uploads::UploadRepo;
