//! Custom Resource Definitions for Caravel

mod cached_image;

pub use cached_image::{
    CachedImage, CachedImagePhase, CachedImageSpec, CachedImageStatus, PodReference,
};
