//! Core domain types and shared logic for the Wharf registry.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Content digests and references
//! - Manifest structure, media types and reference extraction
//! - Authorization scopes and scope sets
//! - The registry v2 error vocabulary
//! - The vulnerability severity lattice
//! - Startup configuration

pub mod config;
pub mod digest;
pub mod error;
pub mod manifest;
pub mod scope;
pub mod severity;

pub use config::Configuration;
pub use digest::{Digest, DigestAlgorithm};
pub use error::{RegistryError, RegistryErrorCode};
pub use manifest::{
    Descriptor, ManifestReference, ParsedManifest, Platform, PlatformFilter, media_type,
};
pub use scope::{Action, Scope, ScopeSet};
pub use severity::Severity;

/// Lifetime of issued bearer tokens.
pub const TOKEN_LIFETIME_SECS: u64 = 4 * 3600;

/// Clock skew tolerated when verifying token validity windows.
pub const TOKEN_CLOCK_SKEW_SECS: u64 = 3;
