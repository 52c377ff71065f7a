//! HTTPS client for the monitoring service.

pub mod auth;
pub mod session;
pub mod snapshot;

use auth::{digest_authorization, Credentials};
use reqwest::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{Method, StatusCode};
use std::time::Duration;
use url::Url;

pub use session::RetryPolicy;
pub use snapshot::{FetchOutcome, FetchResult};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid server endpoint {0:?}")]
    InvalidEndpoint(String),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(StatusCode),
    #[error("digest auth: {0}")]
    Digest(String),
    #[error("malformed response body: {0}")]
    MalformedBody(String),
    #[error("session response carries no id")]
    MissingSessionId,
}

/// Base URL of the service; a bare host means `https://<host>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    base: Url,
    host: String,
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self, ClientError> {
        let invalid = || ClientError::InvalidEndpoint(raw.to_string());
        let trimmed = raw.trim();
        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("https://{}", trimmed.trim_end_matches('/'))
        };
        let base = Url::parse(&with_scheme).map_err(|_| invalid())?;
        let host = base
            .host_str()
            .filter(|host| is_plausible_host(host, base.port().is_some()))
            .ok_or_else(invalid)?
            .to_string();
        Ok(Self { base, host })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn url(&self, path: &str) -> Result<Url, ClientError> {
        self.base
            .join(path)
            .map_err(|_| ClientError::InvalidEndpoint(format!("{}{path}", self.base)))
    }
}

/// A dotted name, an IP literal, `localhost`, or anything with an explicit port.
fn is_plausible_host(host: &str, has_port: bool) -> bool {
    !host.is_empty()
        && (has_port || host.contains('.') || host.starts_with('[') || host == "localhost")
}

pub struct ApiClient {
    http: reqwest::Client,
    endpoint: Endpoint,
    credentials: Credentials,
    retry: RetryPolicy,
}

impl ApiClient {
    pub fn new(
        endpoint: Endpoint,
        credentials: Credentials,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("vlbimon-bridge/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint,
            credentials,
            retry,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Sends a request carrying the configured credentials.
    ///
    /// Digest credentials cost a round trip: the first, unauthenticated request
    /// returns the challenge that the second one answers.
    async fn send_authenticated(
        &self,
        method: Method,
        path: &str,
    ) -> Result<reqwest::Response, ClientError> {
        let url = self.endpoint.url(path)?;
        match &self.credentials {
            Credentials::Basic { username, password } => Ok(self
                .http
                .request(method, url)
                .basic_auth(username, Some(password))
                .send()
                .await?),
            Credentials::Digest { username, password } => {
                let first = self.http.request(method.clone(), url.clone()).send().await?;
                if first.status() != StatusCode::UNAUTHORIZED {
                    return Ok(first);
                }
                let Some(challenge) = first
                    .headers()
                    .get(WWW_AUTHENTICATE)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string)
                else {
                    return Ok(first);
                };
                let answer = digest_authorization(
                    &challenge,
                    username,
                    password,
                    url.path(),
                    method.as_str(),
                )
                .map_err(|err| ClientError::Digest(err.to_string()))?;
                Ok(self
                    .http
                    .request(method, url)
                    .header(AUTHORIZATION, answer)
                    .send()
                    .await?)
            }
        }
    }
}

/// Decodes a JSON body with simd-json; the buffer is parsed in place.
fn decode_json(mut bytes: Vec<u8>) -> Result<serde_json::Value, ClientError> {
    simd_json::serde::from_slice::<serde_json::Value>(&mut bytes)
        .map_err(|err| ClientError::MalformedBody(err.to_string()))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_gets_https() {
        let endpoint = Endpoint::parse("vlbimon2.science.ru.nl").unwrap();
        assert_eq!(endpoint.host(), "vlbimon2.science.ru.nl");
        assert_eq!(
            endpoint.url("/data/snapshot").unwrap().as_str(),
            "https://vlbimon2.science.ru.nl/data/snapshot"
        );
    }

    #[test]
    fn explicit_scheme_and_port_are_kept() {
        let endpoint = Endpoint::parse("http://127.0.0.1:8080/").unwrap();
        assert_eq!(endpoint.host(), "127.0.0.1");
        assert_eq!(
            endpoint.url("/session/abc").unwrap().as_str(),
            "http://127.0.0.1:8080/session/abc"
        );
    }

    #[test]
    fn rejects_empty_endpoint() {
        assert!(Endpoint::parse("").is_err());
        assert!(Endpoint::parse("   ").is_err());
        assert!(Endpoint::parse("https://").is_err());
        assert!(Endpoint::parse("https:").is_err());
        assert!(Endpoint::parse("https:/").is_err());
    }

    #[test]
    fn accepts_localhost_and_ported_names() {
        assert_eq!(Endpoint::parse("localhost").unwrap().host(), "localhost");
        let ported = Endpoint::parse("monitor:8443").unwrap();
        assert_eq!(ported.host(), "monitor");
        assert_eq!(
            ported.url("/session").unwrap().as_str(),
            "https://monitor:8443/session"
        );
    }
}
