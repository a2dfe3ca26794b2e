//! Manifest and descriptor models for Docker v2 and OCI documents
//!
//! Only the fields replication needs are modelled. Manifests are always
//! re-pushed as the original bytes so unknown fields survive unchanged.

use crate::digest::Digest;
use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};

pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Media types accepted when fetching manifests
pub const ACCEPTED_MANIFEST_TYPES: [&str; 4] =
    [OCI_INDEX, DOCKER_MANIFEST_LIST, OCI_MANIFEST, DOCKER_MANIFEST_V2];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestType {
    DockerV2,
    OciManifest,
    DockerList,
    OciIndex,
}

impl ManifestType {
    /// Recognise a media type, ignoring any `; charset=` style parameters
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        let base = media_type.split(';').next().unwrap_or("").trim();
        match base {
            DOCKER_MANIFEST_V2 => Some(ManifestType::DockerV2),
            OCI_MANIFEST => Some(ManifestType::OciManifest),
            DOCKER_MANIFEST_LIST => Some(ManifestType::DockerList),
            OCI_INDEX => Some(ManifestType::OciIndex),
            _ => None,
        }
    }

    pub fn to_content_type(&self) -> &'static str {
        match self {
            ManifestType::DockerV2 => DOCKER_MANIFEST_V2,
            ManifestType::OciManifest => OCI_MANIFEST,
            ManifestType::DockerList => DOCKER_MANIFEST_LIST,
            ManifestType::OciIndex => OCI_INDEX,
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, ManifestType::DockerList | ManifestType::OciIndex)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(rename = "os.version", default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

/// A content-addressed blob: a filesystem layer or an image config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerDescriptor {
    pub media_type: String,
    pub size: u64,
    pub digest: Digest,
}

/// Entry of a manifest list pointing at a platform specific manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestDescriptor {
    pub media_type: String,
    pub size: u64,
    pub digest: Digest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: LayerDescriptor,
    #[serde(default)]
    pub layers: Vec<LayerDescriptor>,
}

impl ImageManifest {
    /// Every blob the manifest references, config first, duplicates removed
    pub fn blobs(&self) -> Vec<LayerDescriptor> {
        let mut seen = std::collections::HashSet::new();
        std::iter::once(&self.config)
            .chain(self.layers.iter())
            .filter(|blob| seen.insert(blob.digest.clone()))
            .cloned()
            .collect()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestList {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<ManifestDescriptor>,
}

impl ManifestList {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedManifest {
    Image(ImageManifest),
    List(ManifestList),
}

/// Parse a manifest document, trusting the registry's content type first,
/// then the embedded `mediaType`, then the document shape.
pub fn parse_manifest_with_type(
    bytes: &[u8],
    content_type: Option<&str>,
) -> Result<(ManifestType, ParsedManifest)> {
    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| ReplicationError::Manifest(format!("manifest is not valid JSON: {}", e)))?;

    let manifest_type = content_type
        .and_then(ManifestType::from_media_type)
        .or_else(|| {
            value
                .get("mediaType")
                .and_then(|m| m.as_str())
                .and_then(ManifestType::from_media_type)
        })
        .or_else(|| {
            if value.get("manifests").is_some() {
                Some(ManifestType::OciIndex)
            } else if value.get("layers").is_some() {
                Some(ManifestType::OciManifest)
            } else {
                None
            }
        })
        .ok_or_else(|| ReplicationError::Manifest("unrecognised manifest media type".to_string()))?;

    let parsed = if manifest_type.is_list() {
        ParsedManifest::List(serde_json::from_value(value).map_err(|e| {
            ReplicationError::Manifest(format!("invalid manifest list: {}", e))
        })?)
    } else {
        ParsedManifest::Image(serde_json::from_value(value).map_err(|e| {
            ReplicationError::Manifest(format!("invalid image manifest: {}", e))
        })?)
    };

    Ok((manifest_type, parsed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(seed: &str) -> Digest {
        Digest::compute(seed.as_bytes())
    }

    #[test]
    fn test_media_type_with_parameters() {
        assert_eq!(
            ManifestType::from_media_type("application/vnd.oci.image.index.v1+json; charset=utf-8"),
            Some(ManifestType::OciIndex)
        );
        assert!(ManifestType::DockerList.is_list());
        assert!(!ManifestType::DockerV2.is_list());
    }

    #[test]
    fn test_parse_index_by_shape() {
        let list = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{
                "mediaType": OCI_MANIFEST,
                "size": 10,
                "digest": digest("amd64").to_string(),
                "platform": {"architecture": "amd64", "os": "linux"}
            }]
        });
        let bytes = serde_json::to_vec(&list).unwrap();
        let (kind, parsed) = parse_manifest_with_type(&bytes, None).unwrap();
        assert_eq!(kind, ManifestType::OciIndex);
        match parsed {
            ParsedManifest::List(list) => {
                assert_eq!(list.manifests.len(), 1);
                assert_eq!(list.manifests[0].platform.as_ref().unwrap().to_string(), "linux/amd64");
            }
            ParsedManifest::Image(_) => panic!("expected a list"),
        }
    }

    #[test]
    fn test_blobs_deduplicates() {
        let layer = LayerDescriptor {
            media_type: "application/vnd.oci.image.layer.v1.tar+gzip".into(),
            size: 3,
            digest: digest("layer"),
        };
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(OCI_MANIFEST.into()),
            config: LayerDescriptor {
                media_type: "application/vnd.oci.image.config.v1+json".into(),
                size: 2,
                digest: digest("config"),
            },
            layers: vec![layer.clone(), layer],
        };
        let blobs = manifest.blobs();
        assert_eq!(blobs.len(), 2);
        assert_eq!(blobs[0].digest, digest("config"));
    }

    #[test]
    fn test_rejects_unknown_document() {
        assert!(parse_manifest_with_type(br#"{"hello": "world"}"#, None).is_err());
    }
}
