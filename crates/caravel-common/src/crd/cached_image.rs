//! CachedImage Custom Resource Definition
//!
//! A CachedImage represents one upstream container image mirrored (or about
//! to be mirrored) into the cluster-local cache registry. The resource is
//! cluster-scoped: pod identities embed their namespace, so a single cached
//! copy serves referencing pods anywhere in the cluster.
//!
//! Field ownership is split between the two reconcilers:
//! - the Pod reconciler owns `spec.referencingPods` and
//!   `spec.lastReferencedAt` (set union/difference under conflict retry),
//! - the CachedImage reconciler owns `status` exclusively.

use std::fmt;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::names::repository_label;

/// Identity of a pod holding a reference to a cached image
#[derive(
    Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "camelCase")]
pub struct PodReference {
    /// Namespace of the referencing pod
    pub namespace: String,
    /// Name of the referencing pod
    pub name: String,
}

impl PodReference {
    /// Create a reference from a pod's namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Spec for a CachedImage
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "caravel.dev",
    version = "v1alpha1",
    kind = "CachedImage",
    plural = "cachedimages",
    shortname = "cimg",
    status = "CachedImageStatus",
    printcolumn = r#"{"name":"Source","type":"string","jsonPath":".spec.sourceReference"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Digest","type":"string","jsonPath":".status.digest","priority":1}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CachedImageSpec {
    /// The original image reference as given by a workload
    /// (registry/repo[:tag|@digest])
    pub source_reference: String,

    /// Pods currently depending on this image. Maintained exclusively by
    /// the Pod reconciler as a sorted set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub referencing_pods: Vec<PodReference>,

    /// Expiry clock anchor: refreshed on every observed reference and on
    /// reference removal. The cached copy is deleted once the reference
    /// set has been empty for the configured expiry delay past this
    /// timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_referenced_at: Option<DateTime<Utc>>,
}

impl CachedImageSpec {
    /// Add a pod to the reference set. Returns `true` if it was not
    /// already present.
    pub fn add_reference(&mut self, pod: &PodReference) -> bool {
        if self.referencing_pods.contains(pod) {
            return false;
        }
        self.referencing_pods.push(pod.clone());
        self.referencing_pods.sort();
        true
    }

    /// Remove a pod from the reference set. Returns `true` if it was
    /// present.
    pub fn remove_reference(&mut self, pod: &PodReference) -> bool {
        let before = self.referencing_pods.len();
        self.referencing_pods.retain(|p| p != pod);
        self.referencing_pods.len() != before
    }

    /// Whether any pod currently references this image
    pub fn is_referenced(&self) -> bool {
        !self.referencing_pods.is_empty()
    }
}

impl CachedImage {
    /// Build a new CachedImage for a source reference first observed on
    /// the given pod. The resource name is the sanitized repository label
    /// of the source reference.
    pub fn for_source(source: &str, referenced_by: PodReference, observed_at: DateTime<Utc>) -> Self {
        CachedImage::new(
            &repository_label(source),
            CachedImageSpec {
                source_reference: source.to_string(),
                referencing_pods: vec![referenced_by],
                last_referenced_at: Some(observed_at),
            },
        )
    }
}

/// Status of a CachedImage, written only by the CachedImage reconciler
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CachedImageStatus {
    /// Current phase of the cache lifecycle
    #[serde(default)]
    pub phase: CachedImagePhase,

    /// Manifest digest of the cached copy, once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,

    /// Human-readable failure message when phase is `Error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Phase of a CachedImage's cache lifecycle
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CachedImagePhase {
    /// Mirroring requested but not yet performed
    #[default]
    Pending,
    /// The image is present in the local cache registry
    Cached,
    /// The last transfer attempt failed; see `message`
    Error,
    /// Unreferenced past the expiry delay; deletion in progress
    Deleting,
}

impl fmt::Display for CachedImagePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CachedImagePhase::Pending => "Pending",
            CachedImagePhase::Cached => "Cached",
            CachedImagePhase::Error => "Error",
            CachedImagePhase::Deleting => "Deleting",
        };
        f.write_str(s)
    }
}
