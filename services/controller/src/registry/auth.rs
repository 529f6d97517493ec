//! `WWW-Authenticate` challenges of the distribution token flow.

use std::collections::HashMap;

/// An authentication challenge returned with a `401`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    /// Token flow: fetch a bearer token from `realm`.
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
    /// Plain basic authentication.
    Basic,
}

impl Challenge {
    /// Parse a `WWW-Authenticate` header value.
    ///
    /// Returns `None` for unknown schemes or a bearer challenge without realm.
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, rest) = header.split_once(' ').unwrap_or((header, ""));

        if scheme.eq_ignore_ascii_case("basic") {
            return Some(Challenge::Basic);
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut params = parse_params(rest);
        Some(Challenge::Bearer {
            realm: params.remove("realm")?,
            service: params.remove("service"),
            scope: params.remove("scope"),
        })
    }
}

/// Parse `key="value",key=value` pairs. Quoted values may contain commas.
fn parse_params(raw: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut chars = raw.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| *c == ',' || c.is_whitespace()) {
            chars.next();
        }

        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '"' => break,
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    c => value.push(c),
                }
            }
        } else {
            while let Some(c) = chars.peek().copied() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }

        params.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    params
}

/// Token scope for repository access.
pub fn scope(repository: &str, actions: &str) -> String {
    format!("repository:{repository}:{actions}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_docker_hub_challenge() {
        let header = r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/alpine:pull""#;

        assert_eq!(
            Challenge::parse(header),
            Some(Challenge::Bearer {
                realm: "https://auth.docker.io/token".to_string(),
                service: Some("registry.docker.io".to_string()),
                scope: Some("repository:library/alpine:pull".to_string()),
            })
        );
    }

    #[test]
    fn test_parse_scope_with_comma() {
        let header = r#"Bearer realm="https://ghcr.io/token",scope="repository:org/app:pull,push""#;

        let Some(Challenge::Bearer { scope, service, .. }) = Challenge::parse(header) else {
            panic!("expected bearer challenge");
        };
        assert_eq!(scope.as_deref(), Some("repository:org/app:pull,push"));
        assert_eq!(service, None);
    }

    #[test]
    fn test_parse_unquoted_params() {
        let header = "bearer realm=https://r.example/token, service=r.example";
        assert_eq!(
            Challenge::parse(header),
            Some(Challenge::Bearer {
                realm: "https://r.example/token".to_string(),
                service: Some("r.example".to_string()),
                scope: None,
            })
        );
    }

    #[test]
    fn test_parse_basic_and_unknown() {
        assert_eq!(Challenge::parse(r#"Basic realm="Registry""#), Some(Challenge::Basic));
        assert_eq!(Challenge::parse("Negotiate"), None);
        assert_eq!(Challenge::parse(r#"Bearer service="x""#), None);
    }

    #[test]
    fn test_scope() {
        assert_eq!(scope("library/nginx", "pull"), "repository:library/nginx:pull");
    }
}
