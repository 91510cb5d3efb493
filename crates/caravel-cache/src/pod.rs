//! Pod reconciliation: reference tracking for cached images
//!
//! Watches workload pods and translates their container images into
//! CachedImage interest: a running pod registers itself in the
//! `referencingPods` set of each image it uses (creating the CachedImage
//! on first sight), a terminating or deleted pod is removed from those
//! sets. The original image reference of every container is recorded as
//! a pod annotation so it can be recovered later even if the live
//! container spec has been rewritten.
//!
//! Reference-set mutations are read-modify-write under optimistic
//! concurrency: several pods may race on the same CachedImage, and a
//! conflicting update is re-fetched and re-applied rather than lost.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info};

#[cfg(test)]
use mockall::automock;

use caravel_common::crd::{CachedImage, PodReference};
use caravel_common::names::{container_annotation_key, repository_label};
use caravel_common::retry::{retry_on_conflict, DEFAULT_CONFLICT_ATTEMPTS};
use caravel_common::{Error, Result, FIELD_MANAGER};

/// Requeue backoff for retryable reconcile errors
const ERROR_REQUEUE: Duration = Duration::from_secs(10);

// =============================================================================
// Kube client trait for dependency injection and testability
// =============================================================================

/// Kubernetes operations used by the Pod reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodKubeClient: Send + Sync {
    /// Fetch a CachedImage by name, `None` when absent
    async fn get_cached_image(&self, name: &str) -> Result<Option<CachedImage>>;

    /// Create a new CachedImage resource
    async fn create_cached_image(&self, image: &CachedImage) -> Result<()>;

    /// Update an existing CachedImage. The resource version carried by
    /// the object acts as the optimistic-concurrency token: a stale
    /// update fails with a conflict.
    async fn update_cached_image(&self, image: &CachedImage) -> Result<()>;

    /// Merge the given annotations into a pod's metadata
    async fn annotate_pod(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<()>;
}

/// Real client implementation wrapping a Kubernetes client
pub struct PodKubeClientImpl {
    client: Client,
}

impl PodKubeClientImpl {
    /// Create a client wrapper
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn images(&self) -> Api<CachedImage> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl PodKubeClient for PodKubeClientImpl {
    async fn get_cached_image(&self, name: &str) -> Result<Option<CachedImage>> {
        Ok(self.images().get_opt(name).await?)
    }

    async fn create_cached_image(&self, image: &CachedImage) -> Result<()> {
        self.images()
            .create(&PostParams::default(), image)
            .await?;
        Ok(())
    }

    async fn update_cached_image(&self, image: &CachedImage) -> Result<()> {
        let name = image.name_any();
        self.images()
            .replace(&name, &PostParams::default(), image)
            .await?;
        Ok(())
    }

    async fn annotate_pod(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

// =============================================================================
// Controller context
// =============================================================================

/// Shared state for pod reconciliations
pub struct PodContext {
    /// Kubernetes client (live API server in production, mock in tests)
    pub kube: Arc<dyn PodKubeClient>,
}

impl PodContext {
    /// Create a context from an injected client
    pub fn new(kube: Arc<dyn PodKubeClient>) -> Self {
        Self { kube }
    }

    /// Create a context backed by a live Kubernetes client
    pub fn from_client(client: Client) -> Self {
        Self {
            kube: Arc::new(PodKubeClientImpl::new(client)),
        }
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// One container's image interest, resolved against the pod's
/// original-image annotations
#[derive(Clone, Debug, PartialEq, Eq)]
struct ContainerImage {
    /// Container name within the pod
    container: String,
    /// Original image reference (annotation value when present, live
    /// spec otherwise)
    source: String,
    /// Whether this is an init container
    init: bool,
}

/// Reconcile a pod event.
///
/// Running pods register interest in their images; terminating or
/// deleted pods release it. Both directions are idempotent, so replayed
/// events are harmless.
pub async fn reconcile(pod: Arc<Pod>, ctx: Arc<PodContext>) -> Result<Action> {
    let name = pod.name_any();
    let namespace = pod
        .namespace()
        .ok_or_else(|| Error::internal("pod-reconciler", "pod has no namespace"))?;
    let pod_ref = PodReference::new(namespace.clone(), name.clone());

    let images = referenced_images(&pod);
    if images.is_empty() {
        return Ok(Action::await_change());
    }

    if is_terminal(&pod) {
        debug!(pod = %pod_ref, "pod terminal, releasing image references");
        release_references(&images, &pod_ref, &ctx).await?;
    } else {
        register_references(&images, &pod_ref, &ctx).await?;
        record_annotations(&pod, &namespace, &name, &images, &ctx).await?;
    }

    Ok(Action::await_change())
}

/// Error policy for the pod controller
pub fn error_policy(pod: Arc<Pod>, error: &Error, _ctx: Arc<PodContext>) -> Action {
    error!(
        pod = %pod.name_any(),
        error = %error,
        retryable = error.is_retryable(),
        "pod reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(ERROR_REQUEUE)
    } else {
        Action::await_change()
    }
}

/// Collect the image interest of a pod's containers and init containers.
///
/// The original-image annotation wins over the live container spec: once
/// a container has been recorded, later rewrites of the spec (e.g. by an
/// admission webhook redirecting pulls) do not change which image this
/// pod is counted against.
fn referenced_images(pod: &Pod) -> Vec<ContainerImage> {
    let empty = BTreeMap::new();
    let annotations = pod.metadata.annotations.as_ref().unwrap_or(&empty);
    let spec = match &pod.spec {
        Some(spec) => spec,
        None => return Vec::new(),
    };

    let mut images = Vec::new();
    let init_containers = spec.init_containers.as_deref().unwrap_or(&[]);
    for (containers, init) in [(init_containers, true), (spec.containers.as_slice(), false)] {
        for container in containers {
            let live = match container.image.as_deref() {
                Some(image) if !image.is_empty() => image,
                _ => continue,
            };
            let key = container_annotation_key(&container.name, init);
            let source = annotations
                .get(&key)
                .cloned()
                .unwrap_or_else(|| live.to_string());
            images.push(ContainerImage {
                container: container.name.clone(),
                source,
                init,
            });
        }
    }
    images
}

/// Whether the pod no longer holds its images: being deleted, or in a
/// terminal phase
fn is_terminal(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return true;
    }
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

/// Register this pod in the reference set of every image it uses,
/// creating CachedImage resources on first sight
async fn register_references(
    images: &[ContainerImage],
    pod_ref: &PodReference,
    ctx: &PodContext,
) -> Result<()> {
    let mut seen = BTreeSet::new();
    for image in images {
        let label = repository_label(&image.source);
        if !seen.insert(label.clone()) {
            continue;
        }

        let source = image.source.as_str();
        let name = label.as_str();
        retry_on_conflict(DEFAULT_CONFLICT_ATTEMPTS, "register image reference", || {
            async move {
                match ctx.kube.get_cached_image(name).await? {
                    Some(mut existing) => {
                        let added = existing.spec.add_reference(pod_ref);
                        existing.spec.last_referenced_at = Some(Utc::now());
                        ctx.kube.update_cached_image(&existing).await?;
                        if added {
                            debug!(pod = %pod_ref, image = %name, "registered image reference");
                        }
                        Ok(())
                    }
                    None => {
                        let cached =
                            CachedImage::for_source(source, pod_ref.clone(), Utc::now());
                        ctx.kube.create_cached_image(&cached).await?;
                        info!(
                            pod = %pod_ref,
                            image = %name,
                            source = %source,
                            "requested caching of new image"
                        );
                        Ok(())
                    }
                }
            }
        })
        .await?;
    }
    Ok(())
}

/// Remove this pod from the reference set of every image it was counted
/// against. The removal timestamp becomes the expiry clock anchor.
async fn release_references(
    images: &[ContainerImage],
    pod_ref: &PodReference,
    ctx: &PodContext,
) -> Result<()> {
    let mut seen = BTreeSet::new();
    for image in images {
        let label = repository_label(&image.source);
        if !seen.insert(label.clone()) {
            continue;
        }

        let name = label.as_str();
        retry_on_conflict(DEFAULT_CONFLICT_ATTEMPTS, "release image reference", || {
            async move {
                match ctx.kube.get_cached_image(name).await? {
                    Some(mut existing) => {
                        if existing.spec.remove_reference(pod_ref) {
                            existing.spec.last_referenced_at = Some(Utc::now());
                            ctx.kube.update_cached_image(&existing).await?;
                            debug!(pod = %pod_ref, image = %name, "released image reference");
                        }
                        Ok(())
                    }
                    // Already gone: nothing to release
                    None => Ok(()),
                }
            }
        })
        .await?;
    }
    Ok(())
}

/// Write the original-image annotation for containers that lack one.
///
/// Existing annotations are never overwritten: they are the durable
/// record of the image the pod originally asked for.
async fn record_annotations(
    pod: &Pod,
    namespace: &str,
    name: &str,
    images: &[ContainerImage],
    ctx: &PodContext,
) -> Result<()> {
    let empty = BTreeMap::new();
    let existing = pod.metadata.annotations.as_ref().unwrap_or(&empty);

    let mut missing = BTreeMap::new();
    for image in images {
        let key = container_annotation_key(&image.container, image.init);
        if !existing.contains_key(&key) {
            missing.insert(key, image.source.clone());
        }
    }

    if missing.is_empty() {
        return Ok(());
    }

    debug!(
        pod = %name,
        namespace = %namespace,
        count = missing.len(),
        "recording original image annotations"
    );
    ctx.kube.annotate_pod(namespace, name, missing).await
}

// =============================================================================
// Tests
// =============================================================================
