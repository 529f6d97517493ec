//! # imagecache-reference
//!
//! Image reference parsing and cache entry naming.
//!
//! ## Design Principles
//!
//! - Every producer and consumer of cache entry names goes through
//!   [`canonical_name`]; two references that denote the same image always map
//!   to the same name
//! - Registry host equivalence comes from a fixed alias table, never from
//!   heuristics
//! - Parsing is strict: a reference that cannot be fetched is rejected here
//!
//! ## Naming
//!
//! ```text
//! alpine                              -> docker.io-library-alpine-latest
//! docker.io/library/alpine:latest     -> docker.io-library-alpine-latest
//! ghcr.io/org/app@sha256:abc...       -> ghcr.io-org-app-sha256-abc...
//! ```
//!
//! Names longer than 63 characters, or not starting and ending alphanumeric,
//! are replaced by a hex SHA-224 of the sanitized string.

mod error;
mod hosts;
mod name;
mod reference;

pub use error::ReferenceError;
pub use hosts::{canonical_host, endpoint_host, DOCKER_HUB, DOCKER_HUB_ALIASES, DOCKER_HUB_ENDPOINT};
pub use name::{canonical_name, repository_name, sanitize, MAX_NAME_LENGTH};
pub use reference::ImageReference;
