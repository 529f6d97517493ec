//! imagecache controller
//!
//! Caches the images workloads run into an operator-managed registry so pods
//! keep starting when their upstream registries are slow, rate limited or
//! down. Each image is a cluster-scoped `CachedImage` entry; the engine keeps
//! the cache and the entry status converged with upstream and with the pods
//! using it.
//!
//! ## Architecture
//!
//! - **Engine**: one idempotent pass per entry (finalizer, expiry, sync)
//! - **Registry**: OCI distribution client copying images between registries
//! - **Credentials**: pull secrets to registry authentication
//! - **Usage**: reverse index from entries to the pods referencing them
//! - **Controller**: watches and the bounded worker pool driving the engine

pub mod config;
pub mod controller;
pub mod crd;
pub mod credentials;
pub mod desired;
pub mod engine;
pub mod events;
pub mod expiry;
pub mod metrics;
pub mod migration;
pub mod mock;
pub mod registry;
pub mod store;
pub mod usage;
