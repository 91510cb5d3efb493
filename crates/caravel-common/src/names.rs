//! Image-reference sanitization for Kubernetes object names
//!
//! Image references contain characters (`/`, `:`, `@`, uppercase) that are
//! illegal in Kubernetes resource names and annotation keys. The functions
//! here collapse a reference into a legal name deterministically, falling
//! back to a content hash when the sanitized form would exceed the
//! 63-character DNS-label ceiling. The sanitization is lossy: the
//! original reference is preserved separately as a pod annotation.

use std::sync::LazyLock;

use regex::Regex;
use sha1::Sha1;
use sha2::{Digest, Sha224};

/// Kubernetes resource/label names are capped at 63 characters.
const MAX_LABEL_LEN: usize = 63;

/// Annotation key prefix recording a container's original image
const ORIGINAL_IMAGE_PREFIX: &str = "original-image-";

/// Annotation key prefix recording an init container's original image
const ORIGINAL_INIT_IMAGE_PREFIX: &str = "original-init-image-";

// DNS-subdomain segment grammar, as validated by the apimachinery name
// validators. Maximal runs of this grammar survive sanitization; anything
// between runs is dropped.
static NAME_GRAMMAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*")
        .expect("name grammar regex is valid")
});

/// Collapse an image reference into legal Kubernetes-name characters.
///
/// Lowercases the input, extracts the maximal runs matching the
/// DNS-subdomain grammar, and joins them with hyphens. Separator
/// characters like `/`, `:` and `@` are dropped, not escaped.
///
/// ```
/// use caravel_common::names::sanitize_name;
/// assert_eq!(
///     sanitize_name("docker.io/library/nginx:latest"),
///     "docker.io-library-nginx-latest"
/// );
/// ```
pub fn sanitize_name(image: &str) -> String {
    let lowered = image.to_lowercase();
    NAME_GRAMMAR
        .find_iter(&lowered)
        .map(|m| m.as_str())
        .collect::<Vec<_>>()
        .join("-")
}

/// Derive the CachedImage resource name for a repository/image reference.
///
/// Applies [`sanitize_name`]; if the result exceeds 63 characters it is
/// replaced wholesale by the SHA-224 hex digest of the sanitized string
/// (56 characters). The output is always a legal name of at most 63
/// characters, and the mapping is deterministic.
pub fn repository_label(repository: &str) -> String {
    let sanitized = sanitize_name(repository);

    if sanitized.len() > MAX_LABEL_LEN {
        return hex::encode(Sha224::digest(sanitized.as_bytes()));
    }

    sanitized
}

/// Build the pod annotation key recording a container's original image.
///
/// Produces `original-image-<name>` (or `original-init-image-<name>` for
/// init containers). When the formatted key would exceed 63 characters,
/// the container name is first replaced by its SHA-1 hex digest. Writers
/// and readers must agree on this two-tier scheme for the annotation to
/// round-trip.
pub fn container_annotation_key(container_name: &str, init_container: bool) -> String {
    let prefix = if init_container {
        ORIGINAL_INIT_IMAGE_PREFIX
    } else {
        ORIGINAL_IMAGE_PREFIX
    };

    if prefix.len() + container_name.len() > MAX_LABEL_LEN {
        let hashed = hex::encode(Sha1::digest(container_name.as_bytes()));
        return format!("{}{}", prefix, hashed);
    }

    format!("{}{}", prefix, container_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_drops_separators_and_lowercases() {
        assert_eq!(
            sanitize_name("docker.io/library/nginx:latest"),
            "docker.io-library-nginx-latest"
        );
        assert_eq!(
            sanitize_name("GHCR.io/Acme/App@sha256:abc123"),
            "ghcr.io-acme-app-sha256-abc123"
        );
        assert_eq!(sanitize_name("localhost:5000/app"), "localhost-5000-app");
    }

    #[test]
    fn sanitize_output_is_legal_name_material() {
        let inputs = [
            "nginx",
            "docker.io/library/nginx:latest",
            "registry.example.com:8443/team/app@sha256:deadbeef",
            "UPPER/Case:Tag",
            "--weird--//::input..",
        ];
        for input in inputs {
            let out = sanitize_name(input);
            assert!(
                out.chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.'),
                "{:?} produced illegal characters: {:?}",
                input,
                out
            );
            assert!(!out.starts_with('-'), "{:?} starts with hyphen", out);
            assert!(!out.ends_with('-'), "{:?} ends with hyphen", out);
        }
    }

    #[test]
    fn sanitize_is_deterministic() {
        let a = sanitize_name("quay.io/prometheus/node-exporter:v1.3.1");
        let b = sanitize_name("quay.io/prometheus/node-exporter:v1.3.1");
        assert_eq!(a, b);
    }

    #[test]
    fn repository_label_passes_short_names_through() {
        let short = "docker.io/library/nginx:latest";
        assert_eq!(repository_label(short), sanitize_name(short));
    }

    #[test]
    fn repository_label_hashes_past_63_chars() {
        let long = format!("registry.example.com/{}/app:latest", "a".repeat(80));
        let label = repository_label(&long);
        // SHA-224 hex digest
        assert_eq!(label.len(), 56);
        assert!(label.chars().all(|c| c.is_ascii_hexdigit()));
        // Deterministic
        assert_eq!(label, repository_label(&long));
    }

    #[test]
    fn repository_label_never_exceeds_63_chars() {
        let inputs = [
            "nginx".to_string(),
            "a".repeat(63),
            "a".repeat(64),
            format!("ghcr.io/{}:{}", "org/".repeat(20), "tag"),
        ];
        for input in &inputs {
            assert!(repository_label(input).len() <= 63, "input {:?}", input);
        }
    }

    #[test]
    fn distinct_images_get_distinct_labels() {
        assert_ne!(
            repository_label("docker.io/library/nginx:1.21"),
            repository_label("docker.io/library/nginx:1.22")
        );
        let long_a = format!("registry.example.com/{}/a:latest", "x".repeat(80));
        let long_b = format!("registry.example.com/{}/b:latest", "x".repeat(80));
        assert_ne!(repository_label(&long_a), repository_label(&long_b));
    }

    #[test]
    fn annotation_key_formats_by_container_kind() {
        assert_eq!(container_annotation_key("app", false), "original-image-app");
        assert_eq!(
            container_annotation_key("setup", true),
            "original-init-image-setup"
        );
    }

    #[test]
    fn annotation_key_hashes_long_container_names() {
        let long_name = "c".repeat(60);
        let key = container_annotation_key(&long_name, false);
        // "original-image-" + 40 hex chars of SHA-1
        assert_eq!(key.len(), 55);
        assert!(key.starts_with("original-image-"));
        assert!(key.len() <= 63);
        // Stable across calls, so a later reader reconstructs the same key
        assert_eq!(key, container_annotation_key(&long_name, false));
    }

    #[test]
    fn annotation_key_stays_within_63_chars() {
        for len in [1usize, 40, 48, 49, 60, 200] {
            let name = "n".repeat(len);
            assert!(container_annotation_key(&name, false).len() <= 63);
            assert!(container_annotation_key(&name, true).len() <= 63);
        }
    }

    #[test]
    fn annotation_key_is_injective_for_short_names() {
        let keys: Vec<String> = ["app", "sidecar", "init", "app2"]
            .iter()
            .map(|n| container_annotation_key(n, false))
            .collect();
        let mut deduped = keys.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(keys.len(), deduped.len());
    }
}
