//! Controller runner - builds controller futures for the cache controllers
//!
//! Each controller future runs until shutdown; the caller composes them
//! with `join_all`. Construction is kept pure so wiring stays testable.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use caravel_cache::{cached_image, pod};
use caravel_common::crd::CachedImage;
use caravel_registry::RegistryClient;

/// Watcher timeout (seconds) - must be less than the client read timeout
/// so the API server closes idle watches before the client gives up on
/// them.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Build the CachedImage and Pod controller futures
pub fn build_cache_controllers(
    client: Client,
    registry: Arc<dyn RegistryClient>,
    expiry_delay: Duration,
) -> Vec<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let image_ctx = Arc::new(cached_image::Context::from_client(
        client.clone(),
        registry,
        expiry_delay,
    ));
    let cached_images: Api<CachedImage> = Api::all(client.clone());

    let image_ctrl = Controller::new(
        cached_images,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .shutdown_on_signal()
    .run(
        cached_image::reconcile,
        cached_image::error_policy,
        image_ctx,
    )
    .for_each(log_reconcile_result("CachedImage"));

    let pod_ctx = Arc::new(pod::PodContext::from_client(client.clone()));
    let pods: Api<Pod> = Api::all(client);

    let pod_ctrl = Controller::new(pods, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .shutdown_on_signal()
        .run(pod::reconcile, pod::error_policy, pod_ctx)
        .for_each(log_reconcile_result("Pod"));

    tracing::info!("- CachedImage controller");
    tracing::info!("- Pod controller");

    vec![Box::pin(image_ctrl), Box::pin(pod_ctrl)]
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => {
                tracing::debug!(?action, "{} reconciliation completed", controller_name)
            }
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
