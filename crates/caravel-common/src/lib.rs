//! Common types for Caravel: the CachedImage CRD, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod names;
pub mod retry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for Caravel custom resources
pub const CARAVEL_GROUP: &str = "caravel.dev";

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "caravel-controller";
