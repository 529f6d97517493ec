//! Manifest and index documents.
//!
//! Documents are copied byte for byte whenever possible; the typed views here
//! are only used to decide what to copy.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::RegistryError;

pub const OCI_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

/// `Accept` header for manifest requests.
pub const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
    application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.docker.distribution.manifest.v2+json";

/// Returns true for multi-platform index media types.
pub fn is_index(media_type: &str) -> bool {
    media_type == OCI_IMAGE_INDEX || media_type == DOCKER_MANIFEST_LIST
}

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

/// Platform of an index entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// Returns true if any target names this architecture, either bare
    /// (`arm64`) or with its variant (`arm/v7`).
    pub fn matches(&self, targets: &[String]) -> bool {
        targets.iter().any(|target| match target.split_once('/') {
            Some((arch, variant)) => {
                arch == self.architecture && self.variant.as_deref() == Some(variant)
            }
            None => target == &self.architecture,
        })
    }
}

/// Single-platform image manifest.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    #[serde(default)]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    pub fn parse(raw: &[u8]) -> Result<Self, RegistryError> {
        serde_json::from_slice(raw).map_err(|e| RegistryError::InvalidManifest(e.to_string()))
    }

    /// Config blob then layers, in upload order.
    pub fn blobs(&self) -> impl Iterator<Item = &Descriptor> {
        std::iter::once(&self.config).chain(self.layers.iter())
    }
}

/// Multi-platform index.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    #[serde(default)]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
}

/// Determine the media type of a manifest document.
///
/// The `Content-Type` header wins; otherwise the `mediaType` field, then the
/// document shape.
pub fn media_type_of(raw: &[u8], content_type: Option<&str>) -> Result<String, RegistryError> {
    if let Some(content_type) = content_type
        .map(|c| c.split(';').next().unwrap_or(c).trim())
        .filter(|c| c.starts_with("application/vnd."))
    {
        return Ok(content_type.to_string());
    }

    let value: Value =
        serde_json::from_slice(raw).map_err(|e| RegistryError::InvalidManifest(e.to_string()))?;
    if let Some(media_type) = value.get("mediaType").and_then(Value::as_str) {
        return Ok(media_type.to_string());
    }
    if value.get("manifests").is_some() {
        Ok(OCI_IMAGE_INDEX.to_string())
    } else if value.get("layers").is_some() {
        Ok(OCI_IMAGE_MANIFEST.to_string())
    } else {
        Err(RegistryError::InvalidManifest(
            "document is neither a manifest nor an index".to_string(),
        ))
    }
}

/// Keep only the index entries built for `architectures`.
///
/// Returns the document to push and the entries it references. When every
/// entry matches, the original bytes are returned untouched so the digest is
/// preserved.
pub fn filter_index(
    raw: &[u8],
    architectures: &[String],
) -> Result<(Vec<u8>, Vec<Descriptor>), RegistryError> {
    let invalid = |reason: String| RegistryError::InvalidManifest(reason);

    let mut value: Value = serde_json::from_slice(raw).map_err(|e| invalid(e.to_string()))?;
    let entries = value
        .get_mut("manifests")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| invalid("index has no manifests".to_string()))?;

    let total = entries.len();
    let mut kept = Vec::new();
    let mut kept_values = Vec::new();
    for entry in entries.drain(..) {
        let descriptor: Descriptor =
            serde_json::from_value(entry.clone()).map_err(|e| invalid(e.to_string()))?;
        let matches = descriptor
            .platform
            .as_ref()
            .is_some_and(|p| p.matches(architectures));
        if matches {
            kept.push(descriptor);
            kept_values.push(entry);
        }
    }

    if kept.is_empty() {
        return Err(invalid(format!(
            "index has no manifest for architectures {}",
            architectures.join(",")
        )));
    }

    if kept.len() == total {
        return Ok((raw.to_vec(), kept));
    }

    *entries = kept_values;
    let filtered = serde_json::to_vec(&value).map_err(|e| invalid(e.to_string()))?;
    Ok((filtered, kept))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn index() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": OCI_IMAGE_INDEX,
            "manifests": [
                {
                    "mediaType": OCI_IMAGE_MANIFEST,
                    "digest": "sha256:amd",
                    "size": 100,
                    "platform": {"architecture": "amd64", "os": "linux"}
                },
                {
                    "mediaType": OCI_IMAGE_MANIFEST,
                    "digest": "sha256:arm",
                    "size": 200,
                    "platform": {"architecture": "arm64", "os": "linux", "variant": "v8"},
                    "annotations": {"keep": "me"}
                },
                {
                    "mediaType": OCI_IMAGE_MANIFEST,
                    "digest": "sha256:att",
                    "size": 300,
                    "platform": {"architecture": "unknown", "os": "unknown"}
                }
            ]
        }))
        .unwrap()
    }

    fn targets(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_filter_index_single_arch() {
        let (filtered, kept) = filter_index(&index(), &targets(&["amd64"])).unwrap();

        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].digest, "sha256:amd");

        let value: Value = serde_json::from_slice(&filtered).unwrap();
        assert_eq!(value["manifests"].as_array().unwrap().len(), 1);
        assert_eq!(value["mediaType"], OCI_IMAGE_INDEX);
    }

    #[test]
    fn test_filter_index_preserves_entry_fields() {
        let (filtered, kept) = filter_index(&index(), &targets(&["arm64/v8"])).unwrap();
        assert_eq!(kept[0].digest, "sha256:arm");

        let value: Value = serde_json::from_slice(&filtered).unwrap();
        assert_eq!(value["manifests"][0]["annotations"]["keep"], "me");
    }

    #[test]
    fn test_filter_index_untouched_when_all_match() {
        let raw = index();
        let (filtered, kept) =
            filter_index(&raw, &targets(&["amd64", "arm64", "unknown"])).unwrap();

        assert_eq!(kept.len(), 3);
        assert_eq!(filtered, raw);
    }

    #[test]
    fn test_filter_index_no_match() {
        assert!(matches!(
            filter_index(&index(), &targets(&["s390x"])),
            Err(RegistryError::InvalidManifest(_))
        ));
    }

    #[test]
    fn test_platform_matches_variant() {
        let platform = Platform {
            architecture: "arm".to_string(),
            os: "linux".to_string(),
            variant: Some("v7".to_string()),
        };
        assert!(platform.matches(&targets(&["arm"])));
        assert!(platform.matches(&targets(&["arm/v7"])));
        assert!(!platform.matches(&targets(&["arm/v6"])));
        assert!(!platform.matches(&targets(&["amd64"])));
    }

    #[test]
    fn test_media_type_detection() {
        assert_eq!(
            media_type_of(b"{}", Some("application/vnd.oci.image.manifest.v1+json; charset=utf-8"))
                .unwrap(),
            OCI_IMAGE_MANIFEST
        );
        assert_eq!(
            media_type_of(&index(), Some("application/json")).unwrap(),
            OCI_IMAGE_INDEX
        );
        assert_eq!(
            media_type_of(br#"{"manifests": []}"#, None).unwrap(),
            OCI_IMAGE_INDEX
        );
        assert!(media_type_of(b"{}", None).is_err());
        assert!(is_index(DOCKER_MANIFEST_LIST));
        assert!(!is_index(DOCKER_MANIFEST));
    }

    #[test]
    fn test_manifest_blobs() {
        let raw = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "config": {"mediaType": "application/vnd.oci.image.config.v1+json", "digest": "sha256:c", "size": 10},
            "layers": [
                {"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip", "digest": "sha256:l1", "size": 5000},
                {"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip", "digest": "sha256:l2", "size": 3000}
            ]
        }))
        .unwrap();
        let manifest = ImageManifest::parse(&raw).unwrap();

        let digests: Vec<_> = manifest.blobs().map(|b| b.digest.as_str()).collect();
        assert_eq!(digests, vec!["sha256:c", "sha256:l1", "sha256:l2"]);
    }
}
