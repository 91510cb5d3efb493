//! Destination reference derivation
//!
//! A cached copy lives on the local registry under a repository that
//! embeds the source registry host, so distinct upstreams never collide:
//! `quay.io/coreos/etcd:v3.5` is mirrored to
//! `<endpoint>/quay.io/coreos/etcd:v3.5`. A colon in the source registry
//! host (non-standard port) is sanitized to a hyphen so the result stays
//! a legal reference, and the default Docker registry aliases collapse to
//! the canonical `docker.io`.

use oci_distribution::Reference;

use caravel_common::Error;

/// Parse an image reference string, mapping parse failures to the
/// non-retryable invalid-reference error.
pub fn parse_reference(image: &str) -> Result<Reference, Error> {
    Reference::try_from(image).map_err(|e| Error::invalid_reference(image, e.to_string()))
}

/// Derive the local-cache reference for a source image.
///
/// The destination registry is the configured cache endpoint; the
/// destination repository is the source registry host (canonicalized and
/// sanitized) followed by the source repository. Tag and digest carry
/// over unchanged, so a digest-pinned source stays digest-pinned in the
/// cache.
pub fn destination_reference(source: &Reference, endpoint: &str) -> Reference {
    let registry = match source.registry() {
        "" | "index.docker.io" | "registry-1.docker.io" => "docker.io".to_string(),
        other => other.replace(':', "-"),
    };
    let repository = format!("{}/{}", registry, source.repository());

    match source.digest() {
        Some(digest) => {
            Reference::with_digest(endpoint.to_string(), repository, digest.to_string())
        }
        None => {
            let tag = source.tag().unwrap_or("latest");
            Reference::with_tag(endpoint.to_string(), repository, tag.to_string())
        }
    }
}
