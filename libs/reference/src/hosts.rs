//! Canonical registry host table.

/// Canonical name of the Docker Hub registry.
pub const DOCKER_HUB: &str = "docker.io";

/// Host actually serving the Docker Hub distribution API.
pub const DOCKER_HUB_ENDPOINT: &str = "registry-1.docker.io";

/// Every spelling of the Docker Hub registry, historical ones included.
pub const DOCKER_HUB_ALIASES: &[&str] = &[
    "docker.io",
    "index.docker.io",
    "registry-1.docker.io",
    "registry.hub.docker.com",
];

/// Canonicalize a registry host as written in a reference or a credential
/// payload.
///
/// Accepts bare hosts (`ghcr.io`), hosts with ports (`localhost:5000`) and the
/// URL forms found in docker config files (`https://index.docker.io/v1/`).
pub fn canonical_host(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    let host = without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme)
        .to_ascii_lowercase();

    if DOCKER_HUB_ALIASES.contains(&host.as_str()) {
        DOCKER_HUB.to_string()
    } else {
        host
    }
}

/// Host to contact for the distribution API of a canonical registry host.
pub fn endpoint_host(canonical: &str) -> &str {
    if canonical == DOCKER_HUB {
        DOCKER_HUB_ENDPOINT
    } else {
        canonical
    }
}
