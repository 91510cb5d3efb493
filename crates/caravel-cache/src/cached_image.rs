//! CachedImage reconciliation
//!
//! Drives one cached image through its lifecycle:
//! - `Pending`/`Error` → `Cached` by mirroring the source into the local
//!   registry (a no-op when the copy already exists),
//! - `Cached` → `Deleting` → removed once the reference set has been
//!   empty for the configured expiry delay,
//! - `Deleting` → `Cached` when a pod re-references the image before the
//!   registry delete is issued.
//!
//! The reconciler is level-triggered and re-derives everything from the
//! resource plus live registry state, so it survives being re-entered
//! after a crash at any point.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use caravel_common::crd::{CachedImage, CachedImagePhase, CachedImageStatus};
use caravel_common::{Error, Result, FIELD_MANAGER};
use caravel_registry::RegistryClient;

/// Requeue interval for periodic drift checks while the image is
/// referenced. Each check re-verifies the cached copy against the live
/// registry, re-converging after out-of-band deletions.
const DRIFT_CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Requeue backoff for retryable reconcile errors
const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Slow requeue cadence when the upstream image cannot be found: the
/// condition is user-diagnosable from status and full-speed retries
/// cannot fix it.
const SOURCE_MISSING_REQUEUE: Duration = Duration::from_secs(300);

/// Floor for deadline-anchored expiry requeues
const MIN_EXPIRY_REQUEUE: Duration = Duration::from_secs(1);

// =============================================================================
// Kube client trait for dependency injection and testability
// =============================================================================

/// CachedImage store operations used by the reconciler.
///
/// A trait so tests can run the state machine against a mock instead of
/// a live API server.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CachedImageStore: Send + Sync {
    /// Fetch the live resource, `None` when it no longer exists
    async fn get(&self, name: &str) -> Result<Option<CachedImage>>;

    /// Patch the resource's status subresource
    async fn patch_status(&self, name: &str, status: &CachedImageStatus) -> Result<()>;

    /// Delete the resource; already-gone is success
    async fn delete(&self, name: &str) -> Result<()>;
}

/// Real store implementation wrapping a Kubernetes client
pub struct CachedImageStoreImpl {
    client: Client,
}

impl CachedImageStoreImpl {
    /// Create a store backed by the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self) -> Api<CachedImage> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl CachedImageStore for CachedImageStoreImpl {
    async fn get(&self, name: &str) -> Result<Option<CachedImage>> {
        Ok(self.api().get_opt(name).await?)
    }

    async fn patch_status(&self, name: &str, status: &CachedImageStatus) -> Result<()> {
        let patch = serde_json::json!({ "status": status });
        self.api()
            .patch_status(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.api().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// Controller context
// =============================================================================

/// Shared state for CachedImage reconciliations
pub struct Context {
    /// CachedImage store (live API server in production, mock in tests)
    pub store: Arc<dyn CachedImageStore>,
    /// Registry transfer client
    pub registry: Arc<dyn RegistryClient>,
    /// How long a cached image may stay unreferenced before deletion
    pub expiry_delay: Duration,
}

impl Context {
    /// Create a context from explicit dependencies
    pub fn new(
        store: Arc<dyn CachedImageStore>,
        registry: Arc<dyn RegistryClient>,
        expiry_delay: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            expiry_delay,
        }
    }

    /// Create a context backed by a live Kubernetes client
    pub fn from_client(
        client: Client,
        registry: Arc<dyn RegistryClient>,
        expiry_delay: Duration,
    ) -> Self {
        Self {
            store: Arc::new(CachedImageStoreImpl::new(client)),
            registry,
            expiry_delay,
        }
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconcile a CachedImage resource.
///
/// Called on every watch event for the resource and on scheduled
/// requeues. The kube runtime guarantees at most one in-flight reconcile
/// per resource name, so there is never a concurrent transfer or
/// deletion for the same image.
pub async fn reconcile(image: Arc<CachedImage>, ctx: Arc<Context>) -> Result<Action> {
    let name = image.name_any();
    let phase = current_phase(&image);

    debug!(
        image = %name,
        %phase,
        references = image.spec.referencing_pods.len(),
        "reconciling cached image"
    );

    if image.spec.is_referenced() {
        if phase == CachedImagePhase::Deleting {
            info!(image = %name, "image re-referenced, cancelling expiry");
        }
        ensure_cached(&image, &name, &ctx).await?;
        return Ok(Action::requeue(DRIFT_CHECK_INTERVAL));
    }

    let now = Utc::now();
    let age = unreferenced_for(&image, now);
    if age >= ctx.expiry_delay {
        return expire(&image, &name, phase, &ctx).await;
    }

    // Unreferenced but not yet expired: keep the copy converged and fire
    // the next reconcile at the expiry deadline instead of busy-polling.
    ensure_cached(&image, &name, &ctx).await?;
    let remaining = ctx.expiry_delay - age;
    Ok(Action::requeue(remaining.max(MIN_EXPIRY_REQUEUE)))
}

/// Error policy for the CachedImage controller.
///
/// Source-missing gets a slow cadence (status already tells the user what
/// is wrong); other retryable errors back off; permanent errors wait for
/// the spec to change.
pub fn error_policy(image: Arc<CachedImage>, error: &Error, _ctx: Arc<Context>) -> Action {
    if error.is_source_missing() {
        warn!(
            image = %image.name_any(),
            error = %error,
            "upstream image not found, retrying slowly"
        );
        return Action::requeue(SOURCE_MISSING_REQUEUE);
    }

    error!(
        image = %image.name_any(),
        error = %error,
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(ERROR_REQUEUE)
    } else {
        Action::await_change()
    }
}

fn current_phase(image: &CachedImage) -> CachedImagePhase {
    image
        .status
        .as_ref()
        .map(|s| s.phase)
        .unwrap_or_default()
}

fn known_digest(image: &CachedImage) -> Option<String> {
    image.status.as_ref().and_then(|s| s.digest.clone())
}

/// How long the image has been unreferenced, anchored at
/// `lastReferencedAt`. A resource that was never referenced (created by
/// hand) falls back to its creation timestamp so orphans still expire.
fn unreferenced_for(image: &CachedImage, now: DateTime<Utc>) -> Duration {
    let anchor = image
        .spec
        .last_referenced_at
        .or_else(|| image.metadata.creation_timestamp.as_ref().map(|t| t.0))
        .unwrap_or(now);
    (now - anchor).to_std().unwrap_or_default()
}

/// Converge the registry on "this image is cached" and reflect the
/// outcome in status.
///
/// `cache` is idempotent, so this runs on every reconcile: a copy that
/// was deleted out-of-band gets re-mirrored, an intact copy costs one
/// manifest HEAD.
async fn ensure_cached(image: &CachedImage, name: &str, ctx: &Context) -> Result<()> {
    match ctx.registry.cache(&image.spec.source_reference).await {
        Ok(outcome) => {
            if outcome.transferred {
                info!(
                    image = %name,
                    source = %image.spec.source_reference,
                    "image transferred into cache registry"
                );
            }
            let status = CachedImageStatus {
                phase: CachedImagePhase::Cached,
                digest: outcome.digest.or_else(|| known_digest(image)),
                message: None,
            };
            update_status(image, name, ctx, status).await
        }
        Err(e) => {
            let status = CachedImageStatus {
                phase: CachedImagePhase::Error,
                digest: known_digest(image),
                message: Some(e.to_string()),
            };
            update_status(image, name, ctx, status).await?;
            Err(e)
        }
    }
}

/// Patch status only when it differs from what the reconcile observed,
/// so steady-state reconciles do not generate update events.
async fn update_status(
    image: &CachedImage,
    name: &str,
    ctx: &Context,
    desired: CachedImageStatus,
) -> Result<()> {
    if image.status.as_ref() == Some(&desired) {
        return Ok(());
    }
    ctx.store.patch_status(name, &desired).await
}

/// Expiry: mark `Deleting`, delete the registry copy, then remove the
/// resource.
///
/// The live resource is re-read immediately before the registry delete:
/// a reference added at any point up to then cancels the expiry. After
/// the delete has been issued there is nothing left to cancel; a
/// resurrected reference re-mirrors from scratch on its next reconcile.
async fn expire(
    image: &CachedImage,
    name: &str,
    phase: CachedImagePhase,
    ctx: &Context,
) -> Result<Action> {
    if phase != CachedImagePhase::Deleting {
        info!(image = %name, "expiry delay elapsed, deleting cached copy");
        let status = CachedImageStatus {
            phase: CachedImagePhase::Deleting,
            digest: known_digest(image),
            message: None,
        };
        ctx.store.patch_status(name, &status).await?;
    }

    match ctx.store.get(name).await? {
        None => return Ok(Action::await_change()),
        Some(live) if live.spec.is_referenced() => {
            info!(image = %name, "image re-referenced during deletion, cancelling");
            let status = CachedImageStatus {
                phase: CachedImagePhase::Cached,
                digest: known_digest(image),
                message: None,
            };
            ctx.store.patch_status(name, &status).await?;
            return Ok(Action::requeue(DRIFT_CHECK_INTERVAL));
        }
        Some(_) => {}
    }

    ctx.registry.delete(&image.spec.source_reference).await?;
    ctx.store.delete(name).await?;

    info!(
        image = %name,
        source = %image.spec.source_reference,
        "cached image expired and removed"
    );
    Ok(Action::await_change())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use caravel_common::crd::{CachedImageSpec, PodReference};
    use caravel_registry::{CacheOutcome, MockRegistryClient};
    use chrono::Duration as ChronoDuration;
    use kube::api::ObjectMeta;
    use mockall::Sequence;

    const SOURCE: &str = "docker.io/library/nginx:latest";
    const DIGEST: &str = "sha256:0000000000000000000000000000000000000000000000000000000000000000";

    // =========================================================================
    // Fixtures
    // =========================================================================

    fn pod_ref(name: &str) -> PodReference {
        PodReference::new("default", name)
    }

    fn cached_image(refs: Vec<PodReference>, last_referenced: Option<DateTime<Utc>>) -> CachedImage {
        CachedImage {
            metadata: ObjectMeta {
                name: Some("docker.io-library-nginx-latest".to_string()),
                ..Default::default()
            },
            spec: CachedImageSpec {
                source_reference: SOURCE.to_string(),
                referencing_pods: refs,
                last_referenced_at: last_referenced,
            },
            status: None,
        }
    }

    fn with_status(mut image: CachedImage, phase: CachedImagePhase, digest: Option<&str>) -> CachedImage {
        image.status = Some(CachedImageStatus {
            phase,
            digest: digest.map(String::from),
            message: None,
        });
        image
    }

    fn minutes_ago(minutes: i64) -> DateTime<Utc> {
        Utc::now() - ChronoDuration::minutes(minutes)
    }

    fn test_context(
        store: MockCachedImageStore,
        registry: MockRegistryClient,
        expiry_delay: Duration,
    ) -> Arc<Context> {
        Arc::new(Context::new(
            Arc::new(store),
            Arc::new(registry),
            expiry_delay,
        ))
    }

    fn hour() -> Duration {
        Duration::from_secs(3600)
    }

    // =========================================================================
    // Caching stories
    // =========================================================================

    /// Story: a freshly requested image is transferred and marked Cached
    #[tokio::test]
    async fn story_pending_image_is_transferred_and_marked_cached() {
        let image = Arc::new(cached_image(vec![pod_ref("web-0")], Some(Utc::now())));

        let mut registry = MockRegistryClient::new();
        registry.expect_cache().times(1).returning(|_| {
            Ok(CacheOutcome {
                transferred: true,
                digest: Some(DIGEST.to_string()),
            })
        });

        let mut store = MockCachedImageStore::new();
        store
            .expect_patch_status()
            .withf(|_, status| {
                status.phase == CachedImagePhase::Cached
                    && status.digest.as_deref() == Some(DIGEST)
                    && status.message.is_none()
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let action = reconcile(image, test_context(store, registry, hour()))
            .await
            .expect("reconcile should succeed");
        assert_eq!(action, Action::requeue(DRIFT_CHECK_INTERVAL));
    }

    /// Story: an already-cached image is a registry no-op and generates
    /// no status update
    #[tokio::test]
    async fn story_already_cached_image_is_a_noop() {
        let image = cached_image(vec![pod_ref("web-0")], Some(Utc::now()));
        let image = Arc::new(with_status(image, CachedImagePhase::Cached, Some(DIGEST)));

        let mut registry = MockRegistryClient::new();
        registry.expect_cache().times(1).returning(|_| {
            Ok(CacheOutcome {
                transferred: false,
                digest: Some(DIGEST.to_string()),
            })
        });

        let mut store = MockCachedImageStore::new();
        store.expect_patch_status().times(0);

        let action = reconcile(image, test_context(store, registry, hour()))
            .await
            .expect("reconcile should succeed");
        assert_eq!(action, Action::requeue(DRIFT_CHECK_INTERVAL));
    }

    /// Story: a missing upstream image lands in Error with a diagnosable
    /// message, and the error policy retries it on the slow cadence
    #[tokio::test]
    async fn story_missing_source_sets_error_status() {
        let image = Arc::new(cached_image(vec![pod_ref("web-0")], Some(Utc::now())));

        let mut registry = MockRegistryClient::new();
        registry
            .expect_cache()
            .times(1)
            .returning(|_| Err(Error::source_missing(SOURCE)));

        let mut store = MockCachedImageStore::new();
        store
            .expect_patch_status()
            .withf(|_, status| {
                status.phase == CachedImagePhase::Error
                    && status
                        .message
                        .as_deref()
                        .is_some_and(|m| m.contains("source image not found"))
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let ctx = test_context(store, registry, hour());
        let err = reconcile(image.clone(), ctx.clone())
            .await
            .expect_err("reconcile should surface the error");
        assert!(err.is_source_missing());

        assert_eq!(
            error_policy(image, &err, ctx),
            Action::requeue(SOURCE_MISSING_REQUEUE)
        );
    }

    /// Story: a transient transfer failure is recorded and retried with
    /// backoff, and the resource survives
    #[tokio::test]
    async fn story_transfer_failure_is_recorded_and_retried() {
        let image = Arc::new(cached_image(vec![pod_ref("web-0")], Some(Utc::now())));

        let mut registry = MockRegistryClient::new();
        registry
            .expect_cache()
            .times(1)
            .returning(|_| Err(Error::registry("connection reset by peer")));
        registry.expect_delete().times(0);

        let mut store = MockCachedImageStore::new();
        store
            .expect_patch_status()
            .withf(|_, status| status.phase == CachedImagePhase::Error)
            .times(1)
            .returning(|_, _| Ok(()));
        store.expect_delete().times(0);

        let ctx = test_context(store, registry, hour());
        let err = reconcile(image.clone(), ctx.clone())
            .await
            .expect_err("reconcile should surface the error");

        assert_eq!(error_policy(image, &err, ctx), Action::requeue(ERROR_REQUEUE));
    }

    /// Story: an image stuck in Error recovers to Cached once the
    /// transfer succeeds
    #[tokio::test]
    async fn story_errored_image_recovers_on_success() {
        let image = cached_image(vec![pod_ref("web-0")], Some(Utc::now()));
        let mut image = with_status(image, CachedImagePhase::Error, None);
        image.status.as_mut().expect("status was set").message =
            Some("registry error: boom".to_string());
        let image = Arc::new(image);

        let mut registry = MockRegistryClient::new();
        registry.expect_cache().times(1).returning(|_| {
            Ok(CacheOutcome {
                transferred: true,
                digest: Some(DIGEST.to_string()),
            })
        });

        let mut store = MockCachedImageStore::new();
        store
            .expect_patch_status()
            .withf(|_, status| {
                status.phase == CachedImagePhase::Cached && status.message.is_none()
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let action = reconcile(image, test_context(store, registry, hour()))
            .await
            .expect("reconcile should succeed");
        assert_eq!(action, Action::requeue(DRIFT_CHECK_INTERVAL));
    }

    // =========================================================================
    // Expiry stories
    // =========================================================================

    /// Story: an image unreferenced for 59 minutes with a 1 hour expiry
    /// stays cached, and nothing is deleted
    #[tokio::test]
    async fn story_unexpired_image_stays_cached() {
        let image = cached_image(vec![], Some(minutes_ago(59)));
        let image = Arc::new(with_status(image, CachedImagePhase::Cached, Some(DIGEST)));

        let mut registry = MockRegistryClient::new();
        registry.expect_cache().times(1).returning(|_| {
            Ok(CacheOutcome {
                transferred: false,
                digest: Some(DIGEST.to_string()),
            })
        });
        registry.expect_delete().times(0);

        let mut store = MockCachedImageStore::new();
        store.expect_patch_status().times(0);
        store.expect_delete().times(0);

        let action = reconcile(image, test_context(store, registry, hour()))
            .await
            .expect("reconcile should succeed");
        // Requeued at the expiry deadline, not dropped from the queue
        assert_ne!(action, Action::await_change());
    }

    /// Story: an image unreferenced for 61 minutes with a 1 hour expiry
    /// is deleted from the registry and the resource removed
    #[tokio::test]
    async fn story_expired_image_is_deleted() {
        let image = cached_image(vec![], Some(minutes_ago(61)));
        let image = Arc::new(with_status(image, CachedImagePhase::Cached, Some(DIGEST)));
        let live = (*image).clone();

        let mut seq = Sequence::new();
        let mut store = MockCachedImageStore::new();
        let mut registry = MockRegistryClient::new();

        store
            .expect_patch_status()
            .withf(|_, status| status.phase == CachedImagePhase::Deleting)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        store
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_| Ok(Some(live.clone())));
        registry
            .expect_delete()
            .withf(|source| source == SOURCE)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        store
            .expect_delete()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let action = reconcile(image, test_context(store, registry, hour()))
            .await
            .expect("reconcile should succeed");
        assert_eq!(action, Action::await_change());
    }

    /// Story: a reference that appears after expiry was detected, but
    /// before the registry delete is issued, cancels the deletion
    #[tokio::test]
    async fn story_resurrection_before_delete_cancels_expiry() {
        let image = cached_image(vec![], Some(minutes_ago(61)));
        let image = Arc::new(with_status(image, CachedImagePhase::Deleting, Some(DIGEST)));

        // The live read sees a pod that re-referenced the image
        let mut live = (*image).clone();
        live.spec.add_reference(&pod_ref("web-1"));

        let mut store = MockCachedImageStore::new();
        store
            .expect_get()
            .times(1)
            .returning(move |_| Ok(Some(live.clone())));
        store
            .expect_patch_status()
            .withf(|_, status| status.phase == CachedImagePhase::Cached)
            .times(1)
            .returning(|_, _| Ok(()));
        store.expect_delete().times(0);

        let mut registry = MockRegistryClient::new();
        registry.expect_delete().times(0);
        registry.expect_cache().times(0);

        let action = reconcile(image, test_context(store, registry, hour()))
            .await
            .expect("reconcile should succeed");
        assert_eq!(action, Action::requeue(DRIFT_CHECK_INTERVAL));
    }

    /// Story: a reconcile that observes a non-empty reference set while
    /// the image is Deleting returns it to Cached without deleting
    #[tokio::test]
    async fn story_referenced_deleting_image_returns_to_cached() {
        let image = cached_image(vec![pod_ref("web-1")], Some(Utc::now()));
        let image = Arc::new(with_status(image, CachedImagePhase::Deleting, Some(DIGEST)));

        let mut registry = MockRegistryClient::new();
        registry.expect_delete().times(0);
        registry.expect_cache().times(1).returning(|_| {
            Ok(CacheOutcome {
                transferred: false,
                digest: Some(DIGEST.to_string()),
            })
        });

        let mut store = MockCachedImageStore::new();
        store
            .expect_patch_status()
            .withf(|_, status| status.phase == CachedImagePhase::Cached)
            .times(1)
            .returning(|_, _| Ok(()));
        store.expect_delete().times(0);

        let action = reconcile(image, test_context(store, registry, hour()))
            .await
            .expect("reconcile should succeed");
        assert_eq!(action, Action::requeue(DRIFT_CHECK_INTERVAL));
    }

    /// Story: a failed registry delete leaves the resource in Deleting
    /// and is retried, never swallowed
    #[tokio::test]
    async fn story_failed_registry_delete_is_retried() {
        let image = cached_image(vec![], Some(minutes_ago(61)));
        let image = Arc::new(with_status(image, CachedImagePhase::Deleting, Some(DIGEST)));
        let live = (*image).clone();

        let mut store = MockCachedImageStore::new();
        store
            .expect_get()
            .times(1)
            .returning(move |_| Ok(Some(live.clone())));
        store.expect_delete().times(0);

        let mut registry = MockRegistryClient::new();
        registry
            .expect_delete()
            .times(1)
            .returning(|_| Err(Error::registry("registry unavailable")));

        let ctx = test_context(store, registry, hour());
        let err = reconcile(image.clone(), ctx.clone())
            .await
            .expect_err("reconcile should surface the error");

        assert_eq!(error_policy(image, &err, ctx), Action::requeue(ERROR_REQUEUE));
    }

    /// Story: a never-referenced orphan expires from its creation
    /// timestamp
    #[tokio::test]
    async fn story_orphan_expires_from_creation_timestamp() {
        let mut image = cached_image(vec![], None);
        image.metadata.creation_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                minutes_ago(120),
            ));
        let image = Arc::new(with_status(image, CachedImagePhase::Cached, Some(DIGEST)));
        let live = (*image).clone();

        let mut store = MockCachedImageStore::new();
        store
            .expect_patch_status()
            .withf(|_, status| status.phase == CachedImagePhase::Deleting)
            .times(1)
            .returning(|_, _| Ok(()));
        store
            .expect_get()
            .times(1)
            .returning(move |_| Ok(Some(live.clone())));
        store.expect_delete().times(1).returning(|_| Ok(()));

        let mut registry = MockRegistryClient::new();
        registry.expect_delete().times(1).returning(|_| Ok(()));

        let action = reconcile(image, test_context(store, registry, hour()))
            .await
            .expect("reconcile should succeed");
        assert_eq!(action, Action::await_change());
    }
}
