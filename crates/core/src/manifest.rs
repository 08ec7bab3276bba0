//! Manifest parsing and reference extraction.
//!
//! Manifests arrive as raw bytes with a declared media type. Parsing yields a
//! descriptor for the manifest itself (computed digest, byte length) plus the
//! descriptors it references: config and layer blobs for image manifests,
//! child manifests for manifest lists.

use crate::digest::Digest;
use crate::error::{RegistryError, RegistryErrorCode};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Media type constants for the supported manifest formats.
pub mod media_type {
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

    /// Whether this media type describes a manifest list rather than a single image.
    pub fn is_list(media_type: &str) -> bool {
        media_type == DOCKER_MANIFEST_LIST || media_type == OCI_INDEX
    }

    /// Whether this media type is one we can parse at all.
    pub fn is_supported(media_type: &str) -> bool {
        matches!(
            media_type,
            DOCKER_MANIFEST | DOCKER_MANIFEST_LIST | OCI_MANIFEST | OCI_INDEX
        )
    }
}

/// A content descriptor: what a manifest says about something it references.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

/// Platform selector attached to manifest-list entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// A filter restricting which platforms of a manifest list are considered.
///
/// An empty filter matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformFilter(pub Vec<Platform>);

impl PlatformFilter {
    pub fn includes(&self, platform: Option<&Platform>) -> bool {
        if self.0.is_empty() {
            return true;
        }
        match platform {
            Some(p) => self
                .0
                .iter()
                .any(|f| f.os == p.os && f.architecture == p.architecture),
            // entries without a platform selector are never filtered out
            None => true,
        }
    }
}

#[derive(Deserialize)]
struct RawImageManifest {
    config: Descriptor,
    #[serde(default)]
    layers: Vec<Descriptor>,
}

#[derive(Deserialize)]
struct RawManifestList {
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

/// A parsed manifest of either kind.
#[derive(Clone, Debug)]
pub enum ParsedManifest {
    /// A single-image manifest: a config blob plus layer blobs.
    Image {
        config: Descriptor,
        layers: Vec<Descriptor>,
    },
    /// A manifest list / OCI index: references to child manifests.
    List { manifests: Vec<Descriptor> },
}

impl ParsedManifest {
    /// Parse manifest bytes according to their declared media type.
    ///
    /// Returns the parsed manifest and the descriptor of the manifest itself,
    /// with the digest computed from the canonical bytes.
    pub fn parse(
        media_type: &str,
        contents: &[u8],
    ) -> Result<(ParsedManifest, Descriptor), RegistryError> {
        let parsed = if media_type::is_list(media_type) {
            let raw: RawManifestList = serde_json::from_slice(contents)
                .map_err(|e| RegistryErrorCode::ManifestInvalid.with(e.to_string()))?;
            ParsedManifest::List {
                manifests: raw.manifests,
            }
        } else if media_type::is_supported(media_type) {
            let raw: RawImageManifest = serde_json::from_slice(contents)
                .map_err(|e| RegistryErrorCode::ManifestInvalid.with(e.to_string()))?;
            ParsedManifest::Image {
                config: raw.config,
                layers: raw.layers,
            }
        } else {
            return Err(RegistryErrorCode::ManifestInvalid
                .with(format!("unsupported media type: {media_type}")));
        };

        let desc = Descriptor {
            media_type: media_type.to_string(),
            digest: Digest::sha256_of(contents),
            size: contents.len() as u64,
            platform: None,
        };
        Ok((parsed, desc))
    }

    /// All descriptors this manifest references directly, of either kind.
    ///
    /// This is the list that feeds size accounting: the manifest's total size
    /// is its own byte length plus the declared sizes of these references.
    pub fn references(&self) -> Vec<Descriptor> {
        match self {
            Self::Image { config, layers } => {
                let mut refs = Vec::with_capacity(layers.len() + 1);
                refs.push(config.clone());
                refs.extend(layers.iter().cloned());
                refs
            }
            Self::List { manifests } => manifests.clone(),
        }
    }

    /// Referenced blobs (config + layers). Empty for manifest lists.
    pub fn blob_references(&self) -> Vec<Descriptor> {
        match self {
            Self::Image { .. } => self.references(),
            Self::List { .. } => Vec::new(),
        }
    }

    /// Referenced child manifests, optionally platform-filtered. Empty for images.
    pub fn manifest_references(&self, filter: &PlatformFilter) -> Vec<Descriptor> {
        match self {
            Self::Image { .. } => Vec::new(),
            Self::List { manifests } => manifests
                .iter()
                .filter(|d| filter.includes(d.platform.as_ref()))
                .cloned()
                .collect(),
        }
    }

    /// The config blob descriptor, if this is an image manifest.
    pub fn config_descriptor(&self) -> Option<&Descriptor> {
        match self {
            Self::Image { config, .. } => Some(config),
            Self::List { .. } => None,
        }
    }
}

/// A reference to a manifest: either a tag name or a digest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManifestReference {
    Tag(String),
    Digest(Digest),
}

impl ManifestReference {
    /// Parse a URL reference segment. Anything that parses as a digest is a
    /// digest; everything else is treated as a tag name.
    pub fn parse(s: &str) -> Result<Self, RegistryError> {
        if s.contains(':') {
            return Ok(Self::Digest(Digest::parse(s)?));
        }
        if s.is_empty() || s.len() > 128 {
            return Err(RegistryErrorCode::TagInvalid.with(s));
        }
        if !s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-')
        {
            return Err(RegistryErrorCode::TagInvalid.with(s));
        }
        Ok(Self::Tag(s.to_string()))
    }

    pub fn as_digest(&self) -> Option<&Digest> {
        match self {
            Self::Digest(d) => Some(d),
            Self::Tag(_) => None,
        }
    }

    pub fn is_tag(&self) -> bool {
        matches!(self, Self::Tag(_))
    }
}

impl fmt::Display for ManifestReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tag(t) => write!(f, "{t}"),
            Self::Digest(d) => write!(f, "{d}"),
        }
    }
}

/// Validate a repository name (the `<name>` part of `/v2/<name>/...`).
///
/// Path components are lowercase alphanumerics separated by `.`, `_` or `-`,
/// joined with slashes.
pub fn validate_repo_name(name: &str) -> Result<(), RegistryError> {
    let valid = !name.is_empty()
        && name.len() <= 256
        && name.split('/').all(|part| {
            !part.is_empty()
                && part
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"._-".contains(&b))
                && part.bytes().next().is_some_and(|b| b.is_ascii_alphanumeric())
        });
    if valid {
        Ok(())
    } else {
        Err(RegistryErrorCode::NameInvalid.with(name))
    }
}
