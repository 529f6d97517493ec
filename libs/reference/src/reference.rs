//! Image reference parsing.

use std::fmt;
use std::str::FromStr;

use crate::error::ReferenceError;
use crate::hosts::{canonical_host, DOCKER_HUB};

/// Maximum tag length accepted by the distribution API.
const MAX_TAG_LENGTH: usize = 128;

/// A parsed, fully qualified image reference.
///
/// The registry is always canonical (see [`canonical_host`]) and Docker Hub
/// official images carry their implicit `library/` namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageReference {
    /// Parse a reference as written in a workload spec.
    ///
    /// Examples:
    /// - `alpine` -> (docker.io, library/alpine, no tag)
    /// - `ghcr.io/org/repo:v1` -> (ghcr.io, org/repo, v1)
    /// - `localhost:5000/app@sha256:...` -> (localhost:5000, app, digest)
    pub fn parse(raw: &str) -> Result<Self, ReferenceError> {
        let reference = raw.trim();
        if reference.is_empty() {
            return Err(ReferenceError::Empty);
        }
        if reference.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ReferenceError::Whitespace(reference.to_string()));
        }

        let (name_part, digest) = match reference.rsplit_once('@') {
            Some((name, digest)) => {
                validate_digest(reference, digest)?;
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A colon after the last slash separates the tag; earlier ones are ports
        let last_slash = name_part.rfind('/');
        let (name_part, tag) = match name_part.rfind(':') {
            Some(colon) if last_slash.map_or(true, |slash| colon > slash) => {
                let tag = &name_part[colon + 1..];
                validate_tag(reference, tag)?;
                (&name_part[..colon], Some(tag.to_string()))
            }
            _ => (name_part, None),
        };

        let (registry, repository) = match name_part.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (canonical_host(first), rest.to_string())
            }
            _ => (DOCKER_HUB.to_string(), name_part.to_string()),
        };

        let repository = if registry == DOCKER_HUB && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository
        };
        validate_repository(reference, &repository)?;

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Canonical registry host (e.g. `docker.io`).
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Repository path within the registry (e.g. `library/alpine`).
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Explicit tag, if any.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Explicit digest, if any.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Returns true if the reference names a tag or digest explicitly.
    pub fn has_explicit_version(&self) -> bool {
        self.tag.is_some() || self.digest.is_some()
    }

    /// The manifest reference to request: digest, then tag, then `latest`.
    pub fn manifest_reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or("latest")
    }

    /// Repository path of this image inside the cache registry.
    ///
    /// Prefixed with the upstream host so images from different registries
    /// never share a destination.
    pub fn cache_repository(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }
}

impl FromStr for ImageReference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

fn validate_repository(reference: &str, repository: &str) -> Result<(), ReferenceError> {
    let invalid = |reason: &str| ReferenceError::InvalidRepository {
        reference: reference.to_string(),
        reason: reason.to_string(),
    };

    if repository.is_empty() {
        return Err(invalid("repository is empty"));
    }
    for component in repository.split('/') {
        if component.is_empty() {
            return Err(invalid("empty path component"));
        }
        if !component
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(invalid("path components may only contain [A-Za-z0-9._-]"));
        }
        if !component.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            return Err(invalid("path components must start with a letter or digit"));
        }
    }
    Ok(())
}

fn validate_tag(reference: &str, tag: &str) -> Result<(), ReferenceError> {
    let valid = !tag.is_empty()
        && tag.len() <= MAX_TAG_LENGTH
        && tag.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_')
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));

    if valid {
        Ok(())
    } else {
        Err(ReferenceError::InvalidTag {
            reference: reference.to_string(),
            tag: tag.to_string(),
        })
    }
}

fn validate_digest(reference: &str, digest: &str) -> Result<(), ReferenceError> {
    let valid = match digest.split_once(':') {
        Some((algorithm, encoded)) => {
            !algorithm.is_empty()
                && algorithm
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '.' | '_' | '-'))
                && encoded.len() >= 32
                && encoded.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => false,
    };

    if valid {
        Ok(())
    } else {
        Err(ReferenceError::InvalidDigest {
            reference: reference.to_string(),
            digest: digest.to_string(),
        })
    }
}
