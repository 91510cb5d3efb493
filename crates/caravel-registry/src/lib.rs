//! Registry transfer client for Caravel
//!
//! Moves container images between an upstream registry and the
//! cluster-local cache registry. Every operation is idempotent and
//! re-entrant: the calling reconcilers may retry after a partial failure
//! (a crash between "pushed" and "marked Cached", or between "deleted"
//! and "resource removed"), so mirroring an already-mirrored image and
//! deleting an already-absent one both succeed as no-ops.
//!
//! Upstream credentials come from an injected [`Keychain`] capability;
//! the local cache endpoint is always reached anonymously over plain
//! HTTP.

#![deny(missing_docs)]

mod client;
mod keychain;
mod reference;

pub use client::{CacheOutcome, OciTransferClient, RegistryClient, RegistryConfig};
pub use keychain::{AnonymousKeychain, Keychain, StaticKeychain};
pub use reference::{destination_reference, parse_reference};

// Re-export the auth type keychains resolve to, so consumers do not need
// a direct oci-distribution dependency
pub use oci_distribution::secrets::RegistryAuth;

#[cfg(feature = "test-util")]
pub use client::MockRegistryClient;
