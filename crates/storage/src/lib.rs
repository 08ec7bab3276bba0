//! Storage backends for blob and manifest content.
//!
//! The database is the source of truth; storage holds the bytes. Drivers make
//! no consistency promises beyond read-your-writes for a single object.

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::filesystem::FilesystemDriver;
pub use backends::memory::InMemoryDriver;
pub use error::{StorageError, StorageResult};
pub use traits::StorageDriver;

use std::sync::Arc;
use wharf_core::config::StorageConfig;

type DriverConstructor = fn(&StorageConfig) -> StorageResult<Arc<dyn StorageDriver>>;

fn construct_filesystem(cfg: &StorageConfig) -> StorageResult<Arc<dyn StorageDriver>> {
    match cfg {
        StorageConfig::Filesystem { path } => Ok(Arc::new(FilesystemDriver::new(path))),
        _ => Err(StorageError::Backend("not a filesystem config".into())),
    }
}

fn construct_memory(_cfg: &StorageConfig) -> StorageResult<Arc<dyn StorageDriver>> {
    Ok(Arc::new(InMemoryDriver::new()))
}

/// Registry of storage drivers by name.
const DRIVERS: &[(&str, DriverConstructor)] = &[
    ("filesystem", construct_filesystem),
    ("memory", construct_memory),
];

/// Build the storage driver selected by the configuration.
pub fn storage_driver_from_config(cfg: &StorageConfig) -> StorageResult<Arc<dyn StorageDriver>> {
    let name = cfg.driver_name();
    let (_, constructor) = DRIVERS
        .iter()
        .find(|(n, _)| *n == name)
        .ok_or_else(|| StorageError::Backend(format!("unknown storage driver: {name}")))?;
    constructor(cfg)
}
