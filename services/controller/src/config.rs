//! Configuration for the controller.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::TimeDelta;
use imagecache_reconcile::DEFAULT_CONFLICT_ATTEMPTS;

use crate::engine::EngineConfig;
use crate::registry::RegistryClientConfig;

const DEFAULT_REGISTRY_URL: &str = "http://imagecache-registry:5000";
const DEFAULT_EXPIRY_DELAY_SECS: u64 = 30 * 24 * 60 * 60;
const DEFAULT_REGISTRY_TIMEOUT_SECS: u64 = 300;

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Cache registry URL.
    pub registry_url: String,

    /// How long an unused image stays cached.
    pub expiry_delay: Duration,

    /// Entries reconciled in parallel.
    pub workers: u16,

    /// Architectures kept from multi-platform images.
    pub architectures: Vec<String>,

    /// Registries reached without TLS verification (`http://` prefix: plain HTTP).
    pub insecure_registries: Vec<String>,

    /// PEM bundles trusted in addition to the system roots.
    pub root_ca_paths: Vec<PathBuf>,

    /// Timeout for each registry operation; zero disables it.
    pub registry_timeout: Duration,

    /// Namespace of pull secrets when an entry names none.
    pub pull_secrets_namespace: String,

    /// Attempts per optimistic write.
    pub conflict_attempts: u32,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let registry_url = lookup("IMAGECACHE_REGISTRY_URL")
            .unwrap_or_else(|| DEFAULT_REGISTRY_URL.to_string());

        let expiry_delay = Duration::from_secs(parse_or(
            &lookup,
            "IMAGECACHE_EXPIRY_DELAY_SECS",
            DEFAULT_EXPIRY_DELAY_SECS,
        )?);

        let workers = parse_or(&lookup, "IMAGECACHE_WORKERS", 3u16)?.max(1);

        let architectures = lookup("IMAGECACHE_ARCHITECTURES")
            .map(|raw| split_list(&raw))
            .filter(|archs| !archs.is_empty())
            .unwrap_or_else(|| vec!["amd64".to_string()]);

        let insecure_registries = lookup("IMAGECACHE_INSECURE_REGISTRIES")
            .map(|raw| split_list(&raw))
            .unwrap_or_default();

        let root_ca_paths = lookup("IMAGECACHE_ROOT_CA_PATHS")
            .map(|raw| split_list(&raw).into_iter().map(PathBuf::from).collect())
            .unwrap_or_default();

        let registry_timeout = Duration::from_secs(parse_or(
            &lookup,
            "IMAGECACHE_REGISTRY_TIMEOUT_SECS",
            DEFAULT_REGISTRY_TIMEOUT_SECS,
        )?);

        let pull_secrets_namespace = lookup("IMAGECACHE_PULL_SECRETS_NAMESPACE")
            .unwrap_or_else(|| "imagecache-system".to_string());

        let conflict_attempts = parse_or(
            &lookup,
            "IMAGECACHE_CONFLICT_ATTEMPTS",
            DEFAULT_CONFLICT_ATTEMPTS,
        )?;

        let log_level = lookup("IMAGECACHE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            registry_url,
            expiry_delay,
            workers,
            architectures,
            insecure_registries,
            root_ca_paths,
            registry_timeout,
            pull_secrets_namespace,
            conflict_attempts,
            log_level,
        })
    }

    /// Registry client settings, reading the configured CA bundles.
    pub fn registry_client_config(&self) -> Result<RegistryClientConfig> {
        let root_certificates = self
            .root_ca_paths
            .iter()
            .map(|path| {
                std::fs::read(path)
                    .with_context(|| format!("failed to read root CA {}", path.display()))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(RegistryClientConfig {
            cache_registry: self.registry_url.clone(),
            insecure_registries: self.insecure_registries.clone(),
            root_certificates,
            timeout: self.registry_timeout,
        })
    }

    pub fn engine_config(&self) -> Result<EngineConfig> {
        let expiry_delay = TimeDelta::from_std(self.expiry_delay)
            .context("expiry delay out of range")?;

        Ok(EngineConfig {
            expiry_delay,
            architectures: self.architectures.clone(),
            conflict_attempts: self.conflict_attempts,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
