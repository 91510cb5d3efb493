//! Transfer operations against the source and cache registries
//!
//! [`OciTransferClient`] is the single writer for the cache namespace on
//! the local registry, but still treats registry state as untrusted:
//! every operation starts from a manifest HEAD, so out-of-band deletion
//! or manual intervention is re-converged instead of breaking an
//! in-memory assumption.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(feature = "test-util")]
use mockall::automock;
use oci_distribution::client::{Client as OciClient, ClientConfig, ClientProtocol};
use oci_distribution::errors::{OciDistributionError, OciErrorCode};
use oci_distribution::manifest;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::Reference;
use reqwest::StatusCode;
use tracing::{debug, info};

use caravel_common::{Error, Result};

use crate::keychain::Keychain;
use crate::reference::{destination_reference, parse_reference};

/// Default deadline for a single registry operation
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

// Layer media types accepted when pulling a source image. Covers OCI and
// Docker, compressed and uncompressed; layers are moved verbatim, never
// transcoded.
const LAYER_MEDIA_TYPES: &[&str] = &[
    manifest::IMAGE_LAYER_MEDIA_TYPE,
    manifest::IMAGE_LAYER_GZIP_MEDIA_TYPE,
    manifest::IMAGE_DOCKER_LAYER_TAR_MEDIA_TYPE,
    manifest::IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE,
];

/// Configuration for the transfer client
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// host:port of the cluster-local cache registry
    pub endpoint: String,
    /// Deadline applied to each registry operation
    pub operation_timeout: Duration,
}

impl RegistryConfig {
    /// Create a config for the given cache endpoint with the default
    /// operation timeout
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// Override the per-operation deadline
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }
}

/// Result of a [`RegistryClient::cache`] call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheOutcome {
    /// Whether image content was actually transferred (false when the
    /// destination already held the image)
    pub transferred: bool,
    /// Manifest digest of the cached copy, when the registry reported one
    pub digest: Option<String>,
}

/// Transfer operations needed by the reconcilers.
///
/// A trait so the controllers can be tested against a mock registry; the
/// real implementation is [`OciTransferClient`].
#[cfg_attr(feature = "test-util", automock)]
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Mirror a source image into the cache registry.
    ///
    /// Idempotent: returns `transferred: false` without touching the
    /// source when the destination already holds the image. A source
    /// that does not exist under the resolved credentials fails with
    /// [`Error::SourceMissing`].
    async fn cache(&self, source: &str) -> Result<CacheOutcome>;

    /// Delete the cached copy of a source image, by digest.
    ///
    /// Succeeds as a no-op when the cached copy is already absent.
    async fn delete(&self, source: &str) -> Result<()>;
}

/// Registry client backed by `oci-distribution`, with plain-HTTP access
/// to the local cache endpoint and keychain-resolved credentials for
/// upstreams
pub struct OciTransferClient {
    config: RegistryConfig,
    keychain: Arc<dyn Keychain>,
    oci: OciClient,
    http: reqwest::Client,
}

impl OciTransferClient {
    /// Create a transfer client for the given cache endpoint and keychain
    pub fn new(config: RegistryConfig, keychain: Arc<dyn Keychain>) -> Result<Self> {
        let oci = OciClient::new(ClientConfig {
            protocol: ClientProtocol::HttpsExcept(vec![config.endpoint.clone()]),
            ..Default::default()
        });
        let http = reqwest::Client::builder()
            .timeout(config.operation_timeout)
            .build()
            .map_err(|e| {
                Error::internal("registry-client", format!("failed to build http client: {e}"))
            })?;

        Ok(Self {
            config,
            keychain,
            oci,
            http,
        })
    }

    /// Whether the given reference exists on its registry.
    ///
    /// A registry-reported not-found is a valid `false` result, not a
    /// failure; any other error (network, auth, 5xx) is surfaced.
    pub async fn exists(&self, reference: &Reference, auth: &RegistryAuth) -> Result<bool> {
        Ok(self.head(reference, auth).await?.is_some())
    }

    /// Manifest HEAD: `Ok(Some(digest))` when present, `Ok(None)` when the
    /// registry reports the manifest as unknown. Not-found is a valid
    /// result here, not a failure.
    async fn head(&self, reference: &Reference, auth: &RegistryAuth) -> Result<Option<String>> {
        let fetch = self.oci.fetch_manifest_digest(reference, auth);
        match tokio::time::timeout(self.config.operation_timeout, fetch).await {
            Err(_) => Err(Error::registry(format!(
                "manifest HEAD for {} timed out",
                reference.whole()
            ))),
            Ok(Ok(digest)) => Ok(Some(digest)),
            Ok(Err(e)) if is_not_found(&e) => Ok(None),
            Ok(Err(e)) => Err(registry_error("manifest HEAD", reference, e)),
        }
    }
}

#[async_trait]
impl RegistryClient for OciTransferClient {
    async fn cache(&self, source: &str) -> Result<CacheOutcome> {
        let source_ref = parse_reference(source)?;
        let dest_ref = destination_reference(&source_ref, &self.config.endpoint);

        if let Some(digest) = self.head(&dest_ref, &RegistryAuth::Anonymous).await? {
            debug!(
                source = %source_ref.whole(),
                destination = %dest_ref.whole(),
                "image already cached"
            );
            return Ok(CacheOutcome {
                transferred: false,
                digest: Some(digest),
            });
        }

        let auth = self.keychain.resolve(source_ref.registry());
        if !self.exists(&source_ref, &auth).await? {
            return Err(Error::source_missing(source));
        }

        let pull = self.oci.pull(&source_ref, &auth, LAYER_MEDIA_TYPES.to_vec());
        let image = match tokio::time::timeout(self.config.operation_timeout, pull).await {
            Err(_) => {
                return Err(Error::registry(format!(
                    "pull of {} timed out",
                    source_ref.whole()
                )))
            }
            Ok(Err(e)) => return Err(registry_error("pull", &source_ref, e)),
            Ok(Ok(image)) => image,
        };
        let digest = image.digest.clone();

        let push = self.oci.push(
            &dest_ref,
            &image.layers,
            image.config.clone(),
            &RegistryAuth::Anonymous,
            image.manifest.clone(),
        );
        match tokio::time::timeout(self.config.operation_timeout, push).await {
            Err(_) => {
                return Err(Error::registry(format!(
                    "push of {} timed out",
                    dest_ref.whole()
                )))
            }
            Ok(Err(e)) => return Err(registry_error("push", &dest_ref, e)),
            Ok(Ok(_)) => {}
        }

        info!(
            source = %source_ref.whole(),
            destination = %dest_ref.whole(),
            digest = digest.as_deref().unwrap_or("unknown"),
            "mirrored image into cache registry"
        );

        Ok(CacheOutcome {
            transferred: true,
            digest,
        })
    }

    async fn delete(&self, source: &str) -> Result<()> {
        let source_ref = parse_reference(source)?;
        let dest_ref = destination_reference(&source_ref, &self.config.endpoint);

        let digest = match self.head(&dest_ref, &RegistryAuth::Anonymous).await? {
            None => {
                debug!(destination = %dest_ref.whole(), "cached copy already absent");
                return Ok(());
            }
            Some(digest) => digest,
        };

        // Delete by digest, never by tag: the tag may have been repointed
        // at a different image since we cached it.
        let url = format!(
            "http://{}/v2/{}/manifests/{}",
            self.config.endpoint,
            dest_ref.repository(),
            digest
        );
        let response = self.http.delete(&url).send().await.map_err(|e| {
            Error::registry(format!(
                "manifest delete for {} failed: {}",
                dest_ref.whole(),
                e
            ))
        })?;

        match response.status() {
            status if status.is_success() => {
                info!(
                    destination = %dest_ref.whole(),
                    digest = %digest,
                    "deleted cached copy"
                );
                Ok(())
            }
            StatusCode::NOT_FOUND => Ok(()),
            StatusCode::METHOD_NOT_ALLOWED => Err(Error::registry_permanent(format!(
                "registry at {} does not allow manifest deletion",
                self.config.endpoint
            ))),
            status => Err(Error::registry(format!(
                "manifest delete for {} returned {}",
                dest_ref.whole(),
                status
            ))),
        }
    }
}

/// Whether a registry error means "the manifest is not there", which the
/// callers treat as a valid absent result rather than a failure
fn is_not_found(err: &OciDistributionError) -> bool {
    match err {
        OciDistributionError::ImageManifestNotFoundError(_) => true,
        OciDistributionError::ServerError { code, .. } => *code == 404,
        OciDistributionError::RegistryError { envelope, .. } => {
            envelope.errors.iter().any(|e| {
                matches!(
                    e.code,
                    OciErrorCode::ManifestUnknown
                        | OciErrorCode::NameUnknown
                        | OciErrorCode::BlobUnknown
                )
            })
        }
        _ => false,
    }
}

fn registry_error(operation: &str, reference: &Reference, err: OciDistributionError) -> Error {
    Error::registry(format!(
        "{} for {} failed: {}",
        operation,
        reference.whole(),
        err
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_from_404_head() {
        let err = OciDistributionError::ServerError {
            code: 404,
            url: "http://localhost:5000/v2/x/manifests/latest".to_string(),
            message: "manifest unknown".to_string(),
        };
        assert!(is_not_found(&err));
    }

    #[test]
    fn not_found_maps_from_manifest_lookup() {
        let err = OciDistributionError::ImageManifestNotFoundError("x:latest".to_string());
        assert!(is_not_found(&err));
    }

    #[test]
    fn other_server_errors_are_not_not_found() {
        let err = OciDistributionError::ServerError {
            code: 503,
            url: "http://localhost:5000/v2/x/manifests/latest".to_string(),
            message: "unavailable".to_string(),
        };
        assert!(!is_not_found(&err));

        let err = OciDistributionError::GenericError(Some("boom".to_string()));
        assert!(!is_not_found(&err));
    }

    #[test]
    fn registry_errors_default_to_retryable() {
        let source = parse_reference("quay.io/coreos/etcd:v3.5.9").unwrap();
        let err = registry_error(
            "pull",
            &source,
            OciDistributionError::GenericError(Some("connection reset".to_string())),
        );
        assert!(err.is_retryable());
        assert!(err.to_string().contains("quay.io/coreos/etcd"));
    }
}
