//! Recursive manifest and blob validation.

use crate::error::{ClientError, ClientResult};
use crate::repo_client::RepoClient;
use std::collections::HashSet;
use wharf_core::digest::Digest;
use wharf_core::manifest::{ManifestReference, ParsedManifest, PlatformFilter};

/// Holds validation state over the course of several validation calls.
///
/// The cache optimizes validation of submanifests and blobs that are
/// referenced multiple times. A session may be shared between clients for
/// different repositories, so results are keyed by host and repository as
/// well as by reference; for any given digest, validation could succeed in
/// one repo and fail differently in another. The cache is per-session rather
/// than process-global because different sessions may run with different
/// platform filters.
#[derive(Default)]
pub struct ValidationSession {
    validated: HashSet<String>,
}

impl ValidationSession {
    pub fn new() -> Self {
        Self::default()
    }

    fn cache_key(client: &RepoClient, reference: &str) -> String {
        format!("{}/{}/{}", client.host(), client.repo(), reference)
    }

    fn is_validated(&self, client: &RepoClient, reference: &str) -> bool {
        self.validated.contains(&Self::cache_key(client, reference))
    }

    fn insert(&mut self, client: &RepoClient, reference: &str) {
        self.validated.insert(Self::cache_key(client, reference));
    }
}

/// Fetch the given manifest and verify that it parses correctly, then
/// validate everything it references, recursively. Fingerprints are written
/// to the session only after all children passed.
pub async fn validate_manifest(
    client: &RepoClient,
    reference: &ManifestReference,
    session: &mut ValidationSession,
    platform_filter: &PlatformFilter,
) -> ClientResult<()> {
    validate_manifest_at(client, reference, 0, session, platform_filter).await
}

async fn validate_manifest_at(
    client: &RepoClient,
    reference: &ManifestReference,
    level: usize,
    session: &mut ValidationSession,
    platform_filter: &PlatformFilter,
) -> ClientResult<()> {
    if session.is_validated(client, &reference.to_string()) {
        tracing::debug!(%reference, level, "manifest validation cache hit");
        return Ok(());
    }

    let (bytes, media_type) = client.download_manifest(reference).await?;
    let (manifest, desc) = ParsedManifest::parse(&media_type, &bytes)
        .map_err(|e| ClientError::Validation(e.to_string()))?;
    if let Some(expected) = reference.as_digest() {
        if *expected != desc.digest {
            return Err(ClientError::DigestMismatch {
                expected: expected.to_string(),
                actual: desc.digest.to_string(),
            });
        }
    }
    tracing::debug!(%reference, level, digest = %desc.digest, "manifest parses");

    for blob_ref in manifest.blob_references() {
        validate_blob_at(client, &blob_ref.digest, level + 1, session).await?;
    }
    for child in manifest.manifest_references(platform_filter) {
        let child_ref = ManifestReference::Digest(child.digest.clone());
        Box::pin(validate_manifest_at(
            client,
            &child_ref,
            level + 1,
            session,
            platform_filter,
        ))
        .await?;
    }

    // cache validity only after all references validated as well
    session.insert(client, &desc.digest.to_string());
    session.insert(client, &reference.to_string());
    Ok(())
}

/// Fetch the given blob and verify that its contents produce the digest.
pub async fn validate_blob(
    client: &RepoClient,
    digest: &Digest,
    session: &mut ValidationSession,
) -> ClientResult<()> {
    validate_blob_at(client, digest, 0, session).await
}

async fn validate_blob_at(
    client: &RepoClient,
    digest: &Digest,
    level: usize,
    session: &mut ValidationSession,
) -> ClientResult<()> {
    let reference = digest.to_string();
    if session.is_validated(client, &reference) {
        tracing::debug!(digest = %reference, level, "blob validation cache hit");
        return Ok(());
    }

    let contents = client.download_blob(&reference).await?;
    if !digest.matches(&contents) {
        return Err(ClientError::DigestMismatch {
            expected: reference,
            actual: Digest::sha256_of(&contents).to_string(),
        });
    }

    session.insert(client, &reference);
    Ok(())
}
