//! Image model: manifests, descriptors and references
//!
//! Manifests are parsed into [`ParsedManifest`] to discover blobs and
//! platform children; the original bytes are what gets replicated.

pub mod manifest;
pub mod reference;

pub use manifest::{
    ImageManifest, LayerDescriptor, ManifestDescriptor, ManifestList, ManifestType,
    ParsedManifest, Platform, parse_manifest_with_type,
};
pub use reference::{ImageReference, Reference};
