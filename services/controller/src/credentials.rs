//! Upstream credential resolution from pull secrets.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use imagecache_pull_secrets::{
    DockerConfig, PullSecretsError, RegistryAuth, DOCKER_CFG_KEY, DOCKER_CONFIG_JSON_KEY,
};
use imagecache_reference::ImageReference;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::Client;
use thiserror::Error;
use tracing::debug;

use crate::store::StoreError;

/// Errors resolving credentials.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("pull secret {namespace}/{name} not found")]
    SecretMissing { namespace: String, name: String },

    #[error("pull secret {namespace}/{name} holds no docker config")]
    NotDockerConfig { namespace: String, name: String },

    #[error("pull secret {namespace}/{name}: {source}")]
    Format {
        namespace: String,
        name: String,
        #[source]
        source: PullSecretsError,
    },

    #[error("reading pull secret: {0}")]
    Store(#[from] StoreError),
}

/// Source of secret payloads.
#[async_trait]
pub trait SecretSource: Send + Sync {
    /// Data of a secret; `None` if the secret does not exist.
    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, StoreError>;
}

/// Secrets read from the Kubernetes API.
#[derive(Clone)]
pub struct KubeSecrets {
    client: Client,
}

impl KubeSecrets {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretSource for KubeSecrets {
    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, StoreError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get_opt(name).await?;
        Ok(secret.map(|s| {
            s.data
                .unwrap_or_default()
                .into_iter()
                .map(|(key, value)| (key, value.0))
                .collect()
        }))
    }
}

/// Resolves the credentials for an image from its ordered pull secrets.
#[derive(Clone)]
pub struct CredentialResolver {
    source: Arc<dyn SecretSource>,
    default_namespace: String,
}

impl CredentialResolver {
    pub fn new(source: Arc<dyn SecretSource>, default_namespace: impl Into<String>) -> Self {
        Self {
            source,
            default_namespace: default_namespace.into(),
        }
    }

    /// Credentials for the registry of `image`.
    ///
    /// Secrets are read in order and only until one has an entry for the
    /// registry. No matching secret means anonymous access.
    pub async fn resolve(
        &self,
        image: &ImageReference,
        namespace: Option<&str>,
        secret_names: &[String],
    ) -> Result<RegistryAuth, CredentialError> {
        let namespace = namespace.unwrap_or(&self.default_namespace);

        for name in secret_names {
            let config = self.load(namespace, name).await?;
            let credentials = config
                .credentials_for(image.registry())
                .map_err(|source| CredentialError::Format {
                    namespace: namespace.to_string(),
                    name: name.clone(),
                    source,
                })?;

            if let Some(auth) = credentials {
                debug!(registry = %image.registry(), secret = %name, "Using pull secret");
                return Ok(auth);
            }
        }

        Ok(RegistryAuth::Anonymous)
    }

    async fn load(&self, namespace: &str, name: &str) -> Result<DockerConfig, CredentialError> {
        let data = self
            .source
            .secret_data(namespace, name)
            .await?
            .ok_or_else(|| CredentialError::SecretMissing {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;

        let payload = data
            .get(DOCKER_CONFIG_JSON_KEY)
            .or_else(|| data.get(DOCKER_CFG_KEY))
            .ok_or_else(|| CredentialError::NotDockerConfig {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;

        DockerConfig::parse(payload).map_err(|source| CredentialError::Format {
            namespace: namespace.to_string(),
            name: name.to_string(),
            source,
        })
    }
}
