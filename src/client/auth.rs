//! Credentials from the YAML secrets file, plus the digest challenge/response.
//!
//! ```yaml
//! vlbimon2.science.ru.nl:
//!   digestauth:
//!   - A Username
//!   - their-password
//! ```

use digest_auth::{AuthContext, HttpMethod};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum AuthConfigError {
    #[error("failed to read secrets file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse secrets file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("no basicauth or digestauth entry for {host} in {path}")]
    MissingHost { path: String, host: String },
}

#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic { username: String, password: String },
    Digest { username: String, password: String },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (scheme, username) = match self {
            Credentials::Basic { username, .. } => ("Basic", username),
            Credentials::Digest { username, .. } => ("Digest", username),
        };
        f.debug_struct(scheme)
            .field("username", username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Default, Deserialize)]
struct HostSecrets {
    #[serde(default)]
    basicauth: Option<(String, String)>,
    #[serde(default)]
    digestauth: Option<(String, String)>,
}

impl Credentials {
    pub fn from_secrets_file(path: &Path, host: &str) -> Result<Self, AuthConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| AuthConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_secrets_yaml(&raw, host).map_err(|err| match err {
            AuthConfigError::Parse { source, .. } => AuthConfigError::Parse {
                path: path.display().to_string(),
                source,
            },
            AuthConfigError::MissingHost { host, .. } => AuthConfigError::MissingHost {
                path: path.display().to_string(),
                host,
            },
            other => other,
        })
    }

    pub fn from_secrets_yaml(raw: &str, host: &str) -> Result<Self, AuthConfigError> {
        let mut hosts: HashMap<String, HostSecrets> =
            serde_yaml::from_str(raw).map_err(|source| AuthConfigError::Parse {
                path: "<inline>".to_string(),
                source,
            })?;
        let missing = || AuthConfigError::MissingHost {
            path: "<inline>".to_string(),
            host: host.to_string(),
        };
        let entry = hosts.remove(host).ok_or_else(missing)?;
        if let Some((username, password)) = entry.basicauth {
            return Ok(Credentials::Basic { username, password });
        }
        if let Some((username, password)) = entry.digestauth {
            return Ok(Credentials::Digest { username, password });
        }
        Err(missing())
    }
}

/// `Authorization` value answering a `WWW-Authenticate: Digest ...` challenge.
pub fn digest_authorization(
    challenge: &str,
    username: &str,
    password: &str,
    uri: &str,
    method: &str,
) -> Result<String, digest_auth::Error> {
    let mut prompt = digest_auth::parse(challenge)?;
    let context = AuthContext::new_with_method(
        username,
        password,
        uri,
        Option::<&[u8]>::None,
        HttpMethod::from(method),
    );
    Ok(prompt.respond(&context)?.to_header_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRETS: &str = r#"
vlbimon1.science.ru.nl:
  basicauth:
  - A Username
  - their-password
vlbimon2.science.ru.nl:
  digestauth:
  - digest-user
  - digest-pass
empty.example.org: {}
"#;

    #[test]
    fn picks_scheme_per_host() {
        assert_eq!(
            Credentials::from_secrets_yaml(SECRETS, "vlbimon1.science.ru.nl").unwrap(),
            Credentials::Basic {
                username: "A Username".into(),
                password: "their-password".into()
            }
        );
        assert!(matches!(
            Credentials::from_secrets_yaml(SECRETS, "vlbimon2.science.ru.nl").unwrap(),
            Credentials::Digest { .. }
        ));
    }

    #[test]
    fn unknown_or_empty_host_is_an_error() {
        for host in ["nowhere.example.org", "empty.example.org"] {
            assert!(matches!(
                Credentials::from_secrets_yaml(SECRETS, host),
                Err(AuthConfigError::MissingHost { .. })
            ));
        }
    }

    #[test]
    fn debug_output_hides_password() {
        let creds = Credentials::from_secrets_yaml(SECRETS, "vlbimon1.science.ru.nl").unwrap();
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("A Username"));
        assert!(!rendered.contains("their-password"));
    }

    #[test]
    fn digest_answer_echoes_realm_and_nonce() {
        let header = digest_authorization(
            r#"Digest realm="vlbimon", nonce="abc123", qop="auth", algorithm=MD5"#,
            "digest-user",
            "digest-pass",
            "/session",
            "POST",
        )
        .unwrap();
        assert!(header.starts_with("Digest "));
        assert!(header.contains(r#"realm="vlbimon""#));
        assert!(header.contains(r#"nonce="abc123""#));
        assert!(header.contains(r#"uri="/session""#));
    }
}
