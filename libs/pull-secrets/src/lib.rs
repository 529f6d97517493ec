//! Registry pull secret format library.
//!
//! Parses the docker config payloads stored in image pull secrets and looks up
//! credentials per registry host.
//!
//! # Format
//!
//! ```text
//! {"auths": {"ghcr.io": {"auth": "dXNlcjpwYXNz"}}}
//! {"auths": {"https://index.docker.io/v1/": {"username": "user", "password": "pass"}}}
//! {"quay.io": {"auth": "dXNlcjpwYXNz"}}          (legacy .dockercfg)
//! ```
//!
//! Registry keys are canonicalized with the same host table the reference
//! parser uses, so `index.docker.io` and `docker.io` are one registry.

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use imagecache_reference::canonical_host;
use serde::Deserialize;
use thiserror::Error;

/// Secret data key of `kubernetes.io/dockerconfigjson` secrets.
pub const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";

/// Secret data key of legacy `kubernetes.io/dockercfg` secrets.
pub const DOCKER_CFG_KEY: &str = ".dockercfg";

/// Pull secret format errors.
#[derive(Debug, Error)]
pub enum PullSecretsError {
    /// The payload is not a docker config document.
    #[error("malformed docker config: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The combined `auth` token cannot be decoded.
    #[error("invalid auth token for registry '{registry}': {reason}")]
    InvalidAuth { registry: String, reason: String },

    /// The entry names neither an `auth` token nor a username.
    #[error("no usable credentials for registry '{registry}'")]
    MissingCredentials { registry: String },
}

/// Authentication to present to a registry.
#[derive(Clone, PartialEq, Eq, Default)]
pub enum RegistryAuth {
    /// No credentials; token endpoints may still grant anonymous pulls.
    #[default]
    Anonymous,

    /// Username and password (or access token as password).
    Basic { username: String, password: String },
}

impl RegistryAuth {
    /// Returns true if credentials are attached.
    pub fn has_credentials(&self) -> bool {
        matches!(self, Self::Basic { .. })
    }
}

impl fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
        }
    }
}

/// One registry entry as stored in the payload.
#[derive(Debug, Clone, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DockerConfigJson {
    auths: BTreeMap<String, AuthEntry>,
}

/// A parsed docker config, keyed by canonical registry host.
#[derive(Debug, Clone, Default)]
pub struct DockerConfig {
    entries: BTreeMap<String, AuthEntry>,
}

impl DockerConfig {
    /// Parse a `.dockerconfigjson` or legacy `.dockercfg` payload.
    pub fn parse(payload: &[u8]) -> Result<Self, PullSecretsError> {
        let value: serde_json::Value = serde_json::from_slice(payload)?;

        let raw: BTreeMap<String, AuthEntry> = if value.get("auths").is_some() {
            serde_json::from_value::<DockerConfigJson>(value)?.auths
        } else {
            serde_json::from_value(value)?
        };

        let mut entries = BTreeMap::new();
        for (key, entry) in raw {
            let host = canonical_host(&key);
            // An exact spelling beats an alias of the same registry
            if key == host {
                entries.insert(host, entry);
            } else {
                entries.entry(host).or_insert(entry);
            }
        }

        Ok(Self { entries })
    }

    /// Credentials for a registry host.
    ///
    /// Returns `Ok(None)` when the config has no entry for the host and an
    /// error when the entry exists but cannot be used.
    pub fn credentials_for(&self, registry: &str) -> Result<Option<RegistryAuth>, PullSecretsError> {
        let host = canonical_host(registry);
        let Some(entry) = self.entries.get(&host) else {
            return Ok(None);
        };

        if let Some(token) = entry.auth.as_deref().filter(|t| !t.trim().is_empty()) {
            return decode_auth(&host, token).map(Some);
        }

        match entry.username.as_deref().filter(|u| !u.is_empty()) {
            Some(username) => Ok(Some(RegistryAuth::Basic {
                username: username.to_string(),
                password: entry.password.clone().unwrap_or_default(),
            })),
            None => Err(PullSecretsError::MissingCredentials { registry: host }),
        }
    }
}

/// Decode a base64 `user:pass` token.
fn decode_auth(registry: &str, token: &str) -> Result<RegistryAuth, PullSecretsError> {
    let invalid = |reason: &str| PullSecretsError::InvalidAuth {
        registry: registry.to_string(),
        reason: reason.to_string(),
    };

    let decoded = STANDARD
        .decode(token.trim())
        .map_err(|e| invalid(&e.to_string()))?;
    let decoded = String::from_utf8(decoded).map_err(|_| invalid("token is not UTF-8"))?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| invalid("expected user:password"))?;

    if username.is_empty() {
        return Err(invalid("empty username"));
    }

    Ok(RegistryAuth::Basic {
        username: username.to_string(),
        password: password.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn basic(username: &str, password: &str) -> RegistryAuth {
        RegistryAuth::Basic {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    fn token(user_pass: &str) -> String {
        STANDARD.encode(user_pass)
    }

    #[test]
    fn test_parse_auth_token() {
        let payload = format!(r#"{{"auths":{{"ghcr.io":{{"auth":"{}"}}}}}}"#, token("bot:s3cr:et"));
        let config = DockerConfig::parse(payload.as_bytes()).unwrap();

        assert_eq!(
            config.credentials_for("ghcr.io").unwrap(),
            Some(basic("bot", "s3cr:et"))
        );
        assert_eq!(config.credentials_for("quay.io").unwrap(), None);
    }

    #[test]
    fn test_parse_explicit_fields() {
        let payload = br#"{"auths":{"quay.io":{"username":"robot","password":"pw"}}}"#;
        let config = DockerConfig::parse(payload).unwrap();

        assert_eq!(
            config.credentials_for("quay.io").unwrap(),
            Some(basic("robot", "pw"))
        );
    }

    #[rstest]
    #[case("docker.io")]
    #[case("index.docker.io")]
    #[case("registry-1.docker.io")]
    fn test_docker_hub_aliases(#[case] lookup: &str) {
        let payload = format!(
            r#"{{"auths":{{"https://index.docker.io/v1/":{{"auth":"{}"}}}}}}"#,
            token("hub:pw")
        );
        let config = DockerConfig::parse(payload.as_bytes()).unwrap();

        assert_eq!(
            config.credentials_for(lookup).unwrap(),
            Some(basic("hub", "pw"))
        );
    }

    #[test]
    fn test_parse_legacy_dockercfg() {
        let payload = format!(r#"{{"quay.io":{{"auth":"{}"}}}}"#, token("old:style"));
        let config = DockerConfig::parse(payload.as_bytes()).unwrap();

        assert_eq!(config.credentials_for("ghcr.io").unwrap(), None);
        assert_eq!(
            config.credentials_for("quay.io").unwrap(),
            Some(basic("old", "style"))
        );
    }

    #[test]
    fn test_malformed_payload() {
        assert!(matches!(
            DockerConfig::parse(b"not json"),
            Err(PullSecretsError::Malformed(_))
        ));
        assert!(matches!(
            DockerConfig::parse(br#"{"auths": []}"#),
            Err(PullSecretsError::Malformed(_))
        ));
    }

    #[test]
    fn test_unusable_entries() {
        let payload = br#"{"auths":{"ghcr.io":{"email":"a@b.c"}}}"#;
        let config = DockerConfig::parse(payload).unwrap();
        assert!(matches!(
            config.credentials_for("ghcr.io"),
            Err(PullSecretsError::MissingCredentials { .. })
        ));

        let payload = br#"{"auths":{"ghcr.io":{"auth":"!!!not-base64"}}}"#;
        let config = DockerConfig::parse(payload).unwrap();
        assert!(matches!(
            config.credentials_for("ghcr.io"),
            Err(PullSecretsError::InvalidAuth { .. })
        ));

        let payload = format!(r#"{{"auths":{{"ghcr.io":{{"auth":"{}"}}}}}}"#, token("nocolon"));
        let config = DockerConfig::parse(payload.as_bytes()).unwrap();
        assert!(matches!(
            config.credentials_for("ghcr.io"),
            Err(PullSecretsError::InvalidAuth { .. })
        ));
    }

    #[test]
    fn test_debug_redacts_password() {
        let rendered = format!("{:?}", basic("user", "hunter2"));
        assert!(rendered.contains("user"));
        assert!(!rendered.contains("hunter2"));
    }
}
