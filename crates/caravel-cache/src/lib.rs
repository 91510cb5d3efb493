//! Cache-lifecycle reconcilers for Caravel
//!
//! Two coupled controllers drive the image cache:
//! - the Pod reconciler ([`pod`]) watches workload pods, registers their
//!   images as CachedImage resources, and releases references when pods
//!   terminate;
//! - the CachedImage reconciler ([`cached_image`]) mirrors requested
//!   images into the local registry and garbage-collects cached copies
//!   once they have been unreferenced past the expiry delay.
//!
//! Both reconcilers talk to the cluster and the registry through injected
//! trait objects, so the state machines are testable without a live
//! cluster.

#![deny(missing_docs)]

pub mod cached_image;
pub mod pod;
