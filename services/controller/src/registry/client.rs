//! OCI distribution client for the upstream and cache registries.
//!
//! Reference: https://github.com/opencontainers/distribution-spec

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use imagecache_pull_secrets::RegistryAuth;
use imagecache_reference::{canonical_host, endpoint_host, ImageReference};
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, RETRY_AFTER, WWW_AUTHENTICATE};
use reqwest::{Body, Certificate, Client, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::auth::{self, Challenge};
use super::manifest::{self, Descriptor, ImageIndex, ImageManifest, MANIFEST_ACCEPT};
use super::{ImageRegistry, RegistryError, RemoteImage};

const USER_AGENT: &str = concat!("imagecache/", env!("CARGO_PKG_VERSION"));

/// Token actions requested from upstream registries.
const UPSTREAM_ACTIONS: &str = "pull";

/// Token actions requested from the cache registry.
const CACHE_ACTIONS: &str = "pull,push,delete";

/// Longest error body kept in [`RegistryError::Status`].
const MAX_ERROR_BODY: usize = 512;

/// Configuration for [`RegistryClient`].
#[derive(Debug, Clone)]
pub struct RegistryClientConfig {
    /// Cache registry URL (e.g. `http://imagecache-registry:5000`).
    pub cache_registry: String,
    /// Hosts reached without TLS verification; entries written as
    /// `http://host` are reached over plain HTTP.
    pub insecure_registries: Vec<String>,
    /// Additional PEM bundles trusted for TLS.
    pub root_certificates: Vec<Vec<u8>>,
    /// Bound on each registry operation; zero means unbounded.
    pub timeout: Duration,
}

impl Default for RegistryClientConfig {
    fn default() -> Self {
        Self {
            cache_registry: "http://imagecache-registry:5000".to_string(),
            insecure_registries: Vec::new(),
            root_certificates: Vec::new(),
            timeout: Duration::from_secs(300), // 5 minutes
        }
    }
}

/// Registry client.
pub struct RegistryClient {
    verified: Client,
    unverified: Client,
    cache_base: Url,
    cache_host: String,
    /// Insecure hosts, mapped to whether they use plain HTTP.
    insecure: HashMap<String, bool>,
    timeout: Duration,
}

impl RegistryClient {
    /// Create a new registry client.
    pub fn new(config: RegistryClientConfig) -> Result<Self, RegistryError> {
        let mut builder = Client::builder().user_agent(USER_AGENT);
        for bundle in &config.root_certificates {
            for certificate in Certificate::from_pem_bundle(bundle)? {
                builder = builder.add_root_certificate(certificate);
            }
        }
        let verified = builder.build()?;
        let unverified = Client::builder()
            .user_agent(USER_AGENT)
            .danger_accept_invalid_certs(true)
            .build()?;

        let raw = if config.cache_registry.contains("://") {
            config.cache_registry.clone()
        } else {
            format!("http://{}", config.cache_registry)
        };
        let cache_base = Url::parse(&raw)
            .map_err(|e| RegistryError::Config(format!("cache registry URL {raw}: {e}")))?;
        let cache_host = canonical_host(&raw);

        let insecure = config
            .insecure_registries
            .iter()
            .map(|entry| (canonical_host(entry), entry.trim().starts_with("http://")))
            .collect();

        Ok(Self {
            verified,
            unverified,
            cache_base,
            cache_host,
            insecure,
            timeout: config.timeout,
        })
    }

    /// Host of the cache registry.
    pub fn cache_host(&self) -> &str {
        &self.cache_host
    }

    fn upstream_base(&self, registry: &str) -> Result<(Url, &Client), RegistryError> {
        let (scheme, client) = match self.insecure.get(registry) {
            Some(true) => ("http", &self.unverified),
            Some(false) => ("https", &self.unverified),
            None => ("https", &self.verified),
        };
        let raw = format!("{scheme}://{}/", endpoint_host(registry));
        let base = Url::parse(&raw)
            .map_err(|e| RegistryError::Config(format!("registry URL {raw}: {e}")))?;
        Ok((base, client))
    }

    fn cache_client(&self) -> &Client {
        if self.insecure.contains_key(&self.cache_host) {
            &self.unverified
        } else {
            &self.verified
        }
    }

    fn upstream_session(
        &self,
        image: &ImageReference,
        auth: &RegistryAuth,
    ) -> Result<Session<'_>, RegistryError> {
        let (base, client) = self.upstream_base(image.registry())?;
        Ok(Session::new(
            client,
            base,
            image.registry().to_string(),
            image.repository().to_string(),
            auth.clone(),
            UPSTREAM_ACTIONS,
        ))
    }

    fn cache_session(&self, image: &ImageReference) -> Session<'_> {
        Session::new(
            self.cache_client(),
            self.cache_base.clone(),
            self.cache_host.clone(),
            image.cache_repository(),
            RegistryAuth::Anonymous,
            CACHE_ACTIONS,
        )
    }

    async fn copy_image(
        &self,
        image: &ImageReference,
        remote: &RemoteImage,
        auth: &RegistryAuth,
        architectures: &[String],
    ) -> Result<(), RegistryError> {
        let mut upstream = self.upstream_session(image, auth)?;
        let mut cache = self.cache_session(image);
        let target = image.manifest_reference();

        if !manifest::is_index(&remote.descriptor.media_type) {
            let copied = copy_blobs(&mut upstream, &mut cache, &remote.manifest).await?;
            cache
                .put_manifest(target, &remote.descriptor.media_type, remote.manifest.clone())
                .await?;
            info!(image = %image, digest = %remote.descriptor.digest, copied_bytes = copied, "Image cached");
            return Ok(());
        }

        // A digest reference must resolve to the upstream bytes, so it is never filtered
        let (document, children) = if image.digest().is_some() {
            let index: ImageIndex = serde_json::from_slice(&remote.manifest)
                .map_err(|e| RegistryError::InvalidManifest(e.to_string()))?;
            (remote.manifest.clone(), index.manifests)
        } else {
            let (filtered, children) = manifest::filter_index(&remote.manifest, architectures)?;
            (Bytes::from(filtered), children)
        };

        let mut copied = 0;
        for child in &children {
            let (descriptor, body) = upstream.get_manifest(&child.digest).await?;
            if manifest::is_index(&descriptor.media_type) {
                return Err(RegistryError::InvalidManifest(format!(
                    "nested index {} is not supported",
                    child.digest
                )));
            }
            copied += copy_blobs(&mut upstream, &mut cache, &body).await?;
            cache
                .put_manifest(&child.digest, &descriptor.media_type, body)
                .await?;
        }
        cache
            .put_manifest(target, &remote.descriptor.media_type, document)
            .await?;

        info!(
            image = %image,
            digest = %remote.descriptor.digest,
            platforms = children.len(),
            copied_bytes = copied,
            "Image index cached"
        );
        Ok(())
    }
}

#[async_trait]
impl ImageRegistry for RegistryClient {
    async fn get_descriptor(
        &self,
        image: &ImageReference,
        auth: &RegistryAuth,
    ) -> Result<RemoteImage, RegistryError> {
        with_timeout(self.timeout, async {
            let mut session = self.upstream_session(image, auth)?;
            let (descriptor, manifest) = session.get_manifest(image.manifest_reference()).await?;
            debug!(image = %image, digest = %descriptor.digest, media_type = %descriptor.media_type, "Resolved upstream descriptor");
            Ok::<_, RegistryError>(RemoteImage {
                descriptor,
                manifest,
            })
        })
        .await
    }

    async fn get_local_descriptor(&self, image: &ImageReference) -> Result<Descriptor, RegistryError> {
        with_timeout(self.timeout, async {
            let mut session = self.cache_session(image);
            let (descriptor, _) = session.get_manifest(image.manifest_reference()).await?;
            Ok::<_, RegistryError>(descriptor)
        })
        .await
    }

    async fn cache_image(
        &self,
        image: &ImageReference,
        remote: &RemoteImage,
        auth: &RegistryAuth,
        architectures: &[String],
    ) -> Result<(), RegistryError> {
        with_timeout(self.timeout, self.copy_image(image, remote, auth, architectures)).await
    }

    async fn delete_image(&self, image: &ImageReference) -> Result<bool, RegistryError> {
        with_timeout(self.timeout, async {
            let mut session = self.cache_session(image);
            let descriptor = match session.get_manifest(image.manifest_reference()).await {
                Ok((descriptor, _)) => descriptor,
                Err(e) if e.is_not_found() => return Ok(false),
                Err(e) => return Err(e),
            };
            let deleted = session.delete_manifest(&descriptor.digest).await?;
            if deleted {
                info!(image = %image, digest = %descriptor.digest, "Image removed from cache");
            }
            Ok::<_, RegistryError>(deleted)
        })
        .await
    }

    async fn health_check(&self, registry: &str) -> Result<(), RegistryError> {
        let host = canonical_host(registry);
        let (base, client) = if host == self.cache_host {
            (self.cache_base.clone(), self.cache_client())
        } else {
            self.upstream_base(&host)?
        };
        let url = base
            .join("/v2/")
            .map_err(|e| RegistryError::Config(e.to_string()))?;

        let response = with_timeout(self.timeout, async {
            Ok::<_, RegistryError>(client.get(url).send().await?)
        }).await?;
        match response.status() {
            StatusCode::OK | StatusCode::UNAUTHORIZED => Ok(()),
            status => Err(RegistryError::Status {
                registry: host,
                status: status.as_u16(),
                message: "registry API unavailable".to_string(),
            }),
        }
    }
}

/// Copy the blobs of a single-platform manifest the cache does not hold yet.
///
/// Returns the number of bytes transferred.
async fn copy_blobs(
    upstream: &mut Session<'_>,
    cache: &mut Session<'_>,
    raw_manifest: &[u8],
) -> Result<u64, RegistryError> {
    let manifest = ImageManifest::parse(raw_manifest)?;
    let mut copied = 0;

    for blob in manifest.blobs() {
        if cache.blob_exists(&blob.digest).await? {
            debug!(digest = %blob.digest, "Blob already cached");
            continue;
        }
        let source = upstream.get_blob(&blob.digest).await?;
        cache.push_blob(blob, source).await?;
        copied += blob.size;
    }

    Ok(copied)
}

async fn with_timeout<T, F>(timeout: Duration, operation: F) -> Result<T, RegistryError>
where
    F: Future<Output = Result<T, RegistryError>>,
{
    if timeout.is_zero() {
        return operation.await;
    }
    tokio::time::timeout(timeout, operation)
        .await
        .map_err(|_| RegistryError::Timeout(timeout))?
}

fn header_string(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, Clone)]
enum Credential {
    None,
    Basic,
    Bearer(String),
}

/// Authenticated access to one repository of one registry.
///
/// Tokens obtained from a challenge are reused for every later request.
struct Session<'a> {
    client: &'a Client,
    base: Url,
    registry: String,
    repository: String,
    auth: RegistryAuth,
    actions: &'static str,
    credential: Credential,
}

impl<'a> Session<'a> {
    fn new(
        client: &'a Client,
        base: Url,
        registry: String,
        repository: String,
        auth: RegistryAuth,
        actions: &'static str,
    ) -> Self {
        Self {
            client,
            base,
            registry,
            repository,
            auth,
            actions,
            credential: Credential::None,
        }
    }

    fn url(&self, path: &str) -> Result<Url, RegistryError> {
        self.base
            .join(&format!("/v2/{}/{path}", self.repository))
            .map_err(|e| RegistryError::Config(e.to_string()))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match (&self.credential, &self.auth) {
            (Credential::Bearer(token), _) => request.bearer_auth(token),
            (Credential::Basic, RegistryAuth::Basic { username, password }) => {
                request.basic_auth(username, Some(password))
            }
            _ => request,
        }
    }

    fn unauthorized(&self) -> RegistryError {
        RegistryError::Unauthorized {
            registry: self.registry.clone(),
            credentials_supplied: self.auth.has_credentials(),
        }
    }

    /// Send a request, answering one authentication challenge.
    async fn send<F>(&mut self, build: F) -> Result<Response, RegistryError>
    where
        F: Fn(&Client) -> RequestBuilder + Send,
    {
        let response = self.authorize(build(self.client)).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = header_string(&response, WWW_AUTHENTICATE.as_str())
            .as_deref()
            .and_then(Challenge::parse);
        match challenge {
            Some(Challenge::Bearer {
                realm,
                service,
                scope,
            }) => {
                let token = self
                    .fetch_token(&realm, service.as_deref(), scope.as_deref())
                    .await?;
                self.credential = Credential::Bearer(token);
            }
            Some(Challenge::Basic) if self.auth.has_credentials() => {
                self.credential = Credential::Basic;
            }
            _ => return Err(self.unauthorized()),
        }

        let response = self.authorize(build(self.client)).send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(self.unauthorized());
        }
        Ok(response)
    }

    async fn fetch_token(
        &self,
        realm: &str,
        service: Option<&str>,
        scope: Option<&str>,
    ) -> Result<String, RegistryError> {
        let mut url = Url::parse(realm)
            .map_err(|e| RegistryError::Config(format!("token realm {realm}: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = service {
                query.append_pair("service", service);
            }
            // The registry knows best which scope the request needs
            let scope = scope
                .map(str::to_string)
                .unwrap_or_else(|| auth::scope(&self.repository, self.actions));
            query.append_pair("scope", &scope);
        }

        debug!(registry = %self.registry, repository = %self.repository, "Requesting registry token");

        let mut request = self.client.get(url);
        if let RegistryAuth::Basic { username, password } = &self.auth {
            request = request.basic_auth(username, Some(password));
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(self.status_error(response, "token").await);
        }

        let body: TokenResponse = response.json().await?;
        body.token
            .or(body.access_token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| RegistryError::Status {
                registry: self.registry.clone(),
                status: StatusCode::OK.as_u16(),
                message: "token response carries no token".to_string(),
            })
    }

    async fn status_error(&self, response: Response, what: &str) -> RegistryError {
        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => self.unauthorized(),
            StatusCode::NOT_FOUND => {
                RegistryError::NotFound(format!("{}/{} {what}", self.registry, self.repository))
            }
            StatusCode::TOO_MANY_REQUESTS => RegistryError::RateLimited {
                registry: self.registry.clone(),
                retry_after: header_string(&response, RETRY_AFTER.as_str())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs),
            },
            _ => {
                let body = response.text().await.unwrap_or_default();
                RegistryError::Status {
                    registry: self.registry.clone(),
                    status: status.as_u16(),
                    message: body.chars().take(MAX_ERROR_BODY).collect(),
                }
            }
        }
    }

    async fn get_manifest(&mut self, reference: &str) -> Result<(Descriptor, Bytes), RegistryError> {
        let url = self.url(&format!("manifests/{reference}"))?;
        debug!(url = %url, "Fetching manifest");

        let response = self
            .send(|client| client.get(url.clone()).header(ACCEPT, MANIFEST_ACCEPT))
            .await?;
        if !response.status().is_success() {
            return Err(self.status_error(response, &format!("manifest {reference}")).await);
        }

        let reported = header_string(&response, "docker-content-digest");
        let content_type = header_string(&response, CONTENT_TYPE.as_str());
        let body = response.bytes().await?;

        // Verify digest
        let computed = format!("sha256:{}", hex::encode(Sha256::digest(&body)));
        if reference.starts_with("sha256:") && computed != reference {
            return Err(RegistryError::DigestMismatch {
                expected: reference.to_string(),
                actual: computed,
            });
        }

        let media_type = manifest::media_type_of(&body, content_type.as_deref())?;
        let descriptor = Descriptor {
            media_type,
            digest: reported.unwrap_or(computed),
            size: body.len() as u64,
            platform: None,
        };
        Ok((descriptor, body))
    }

    async fn put_manifest(
        &mut self,
        reference: &str,
        media_type: &str,
        body: Bytes,
    ) -> Result<(), RegistryError> {
        let url = self.url(&format!("manifests/{reference}"))?;
        let response = self
            .send(|client| {
                client
                    .put(url.clone())
                    .header(CONTENT_TYPE, media_type)
                    .body(body.clone())
            })
            .await?;
        if !response.status().is_success() {
            return Err(self.status_error(response, &format!("manifest {reference}")).await);
        }

        debug!(repository = %self.repository, reference = %reference, "Manifest pushed");
        Ok(())
    }

    /// Delete a manifest by digest; returns false if it was already absent.
    async fn delete_manifest(&mut self, digest: &str) -> Result<bool, RegistryError> {
        let url = self.url(&format!("manifests/{digest}"))?;
        let response = self.send(|client| client.delete(url.clone())).await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(self.status_error(response, &format!("manifest {digest}")).await),
        }
    }

    async fn blob_exists(&mut self, digest: &str) -> Result<bool, RegistryError> {
        let url = self.url(&format!("blobs/{digest}"))?;
        let response = self.send(|client| client.head(url.clone())).await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(self.status_error(response, &format!("blob {digest}")).await),
        }
    }

    async fn get_blob(&mut self, digest: &str) -> Result<Response, RegistryError> {
        let url = self.url(&format!("blobs/{digest}"))?;
        debug!(url = %url, "Pulling blob");

        let response = self.send(|client| client.get(url.clone())).await?;
        if !response.status().is_success() {
            return Err(self.status_error(response, &format!("blob {digest}")).await);
        }
        Ok(response)
    }

    /// Monolithic upload: open a session, then stream the blob in one PUT.
    async fn push_blob(&mut self, blob: &Descriptor, source: Response) -> Result<(), RegistryError> {
        let start = self.url("blobs/uploads/")?;
        let response = self
            .send(|client| client.post(start.clone()).header(CONTENT_LENGTH, 0))
            .await?;
        if !response.status().is_success() {
            return Err(self.status_error(response, "upload").await);
        }

        let location = header_string(&response, LOCATION.as_str()).ok_or_else(|| {
            RegistryError::Status {
                registry: self.registry.clone(),
                status: response.status().as_u16(),
                message: "upload session has no location".to_string(),
            }
        })?;
        let mut upload = self
            .base
            .join(&location)
            .map_err(|e| RegistryError::Config(format!("upload location {location}: {e}")))?;
        upload.query_pairs_mut().append_pair("digest", &blob.digest);

        let response = self
            .authorize(self.client.put(upload))
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, blob.size)
            .body(Body::wrap_stream(source.bytes_stream()))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.status_error(response, &format!("blob {}", blob.digest)).await);
        }

        debug!(digest = %blob.digest, size = blob.size, "Blob uploaded");
        Ok(())
    }
}
