//! Manifest and blob fixtures.

use wharf_core::digest::Digest;
use wharf_core::manifest::media_type;

/// A config blob with the given labels, plus its digest.
pub fn config_blob(labels: &[(&str, &str)]) -> (Vec<u8>, Digest) {
    let labels: serde_json::Map<String, serde_json::Value> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
        .collect();
    let bytes = serde_json::to_vec(&serde_json::json!({
        "architecture": "amd64",
        "os": "linux",
        "config": { "labels": labels },
    }))
    .unwrap();
    let digest = Digest::sha256_of(&bytes);
    (bytes, digest)
}

/// A layer blob with deterministic content, plus its digest.
pub fn layer_blob(seed: &str) -> (Vec<u8>, Digest) {
    let bytes = format!("layer-content-{seed}").into_bytes();
    let digest = Digest::sha256_of(&bytes);
    (bytes, digest)
}

/// A docker schema2 image manifest referencing the given config and layers.
pub fn image_manifest(config: &(Vec<u8>, Digest), layers: &[&(Vec<u8>, Digest)]) -> Vec<u8> {
    let layer_entries: Vec<serde_json::Value> = layers
        .iter()
        .map(|(bytes, digest)| {
            serde_json::json!({
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "digest": digest.to_string(),
                "size": bytes.len(),
            })
        })
        .collect();
    serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": media_type::DOCKER_MANIFEST,
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "digest": config.1.to_string(),
            "size": config.0.len(),
        },
        "layers": layer_entries,
    }))
    .unwrap()
}

/// A manifest list referencing the given child manifests.
pub fn manifest_list(children: &[(&Digest, usize)]) -> Vec<u8> {
    let entries: Vec<serde_json::Value> = children
        .iter()
        .enumerate()
        .map(|(idx, (digest, size))| {
            serde_json::json!({
                "mediaType": media_type::DOCKER_MANIFEST,
                "digest": digest.to_string(),
                "size": size,
                "platform": {
                    "architecture": if idx == 0 { "amd64" } else { "arm64" },
                    "os": "linux",
                },
            })
        })
        .collect();
    serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": media_type::DOCKER_MANIFEST_LIST,
        "manifests": entries,
    }))
    .unwrap()
}
