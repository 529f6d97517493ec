//! Cache entry naming.
//!
//! The name of a cache entry is a pure function of its source reference.
//! Producers (the admission webhook creating entries) and consumers (the
//! usage tracker mapping pods back to entries) must agree bit for bit.

use sha2::{Digest, Sha224};

use crate::error::ReferenceError;
use crate::reference::ImageReference;

/// Longest name accepted for a cache entry.
pub const MAX_NAME_LENGTH: usize = 63;

/// Suffix for references that name neither a tag nor a digest.
const IMPLICIT_TAG_SUFFIX: &str = "-latest";

/// Lowercase, replace every character outside `[a-z0-9.-]` with `-` and
/// collapse runs of `-`.
///
/// ```
/// assert_eq!(
///     imagecache_reference::sanitize("docker.io/library/alpine"),
///     "docker.io-library-alpine"
/// );
/// ```
pub fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars().flat_map(char::to_lowercase) {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-' {
            c
        } else {
            '-'
        };
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }
    out
}

/// Compute the cache entry name for a source reference.
///
/// The reference is parsed and fully qualified first, so `alpine` and
/// `docker.io/library/alpine:latest` yield the same name.
pub fn canonical_name(source: &str) -> Result<String, ReferenceError> {
    let image = ImageReference::parse(source)?;

    let mut name = sanitize(&image.to_string());
    if !image.has_explicit_version() {
        name.push_str(IMPLICIT_TAG_SUFFIX);
    }

    Ok(fit(name))
}

/// Label-safe name of the cache repository an image lands in.
///
/// Every tag of one repository shares this value.
pub fn repository_name(image: &ImageReference) -> String {
    fit(sanitize(&image.cache_repository()))
}

/// Hash names that do not fit a label value.
///
/// A name must also start and end alphanumeric; one that does not is hashed
/// rather than trimmed so that `v1` and `v1.` stay distinct.
fn fit(name: String) -> String {
    let bounded = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
    if name.len() > MAX_NAME_LENGTH || !bounded(name.chars().next()) || !bounded(name.chars().last()) {
        hex::encode(Sha224::digest(name.as_bytes()))
    } else {
        name
    }
}
