use super::{decode_json, ApiClient, ClientError};
use reqwest::{Method, StatusCode};
use serde_json::Value as JsonValue;
use std::time::Duration;

const MAX_BACKOFF_FACTOR: u32 = 8;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn forever(base_delay: Duration) -> Self {
        Self {
            base_delay,
            max_attempts: None,
        }
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }

    /// Doubles per failed attempt, capped at 8x the base delay.
    fn backoff(&self, attempts: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempts.saturating_sub(1))
            .unwrap_or(MAX_BACKOFF_FACTOR)
            .min(MAX_BACKOFF_FACTOR);
        self.base_delay.saturating_mul(factor)
    }
}

enum Restore {
    Alive,
    Expired,
}

impl ApiClient {
    /// Returns a usable session id, touching `prior` first when there is one.
    pub async fn acquire_session(&self, prior: Option<&str>) -> Result<String, ClientError> {
        if let Some(id) = prior {
            match self.restore_session(id).await? {
                Restore::Alive => {
                    tracing::info!(server = %self.endpoint.host(), "restored session");
                    return Ok(id.to_string());
                }
                Restore::Expired => {
                    tracing::info!(server = %self.endpoint.host(), "session expired, creating a new one");
                }
            }
        }
        self.create_session().await
    }

    async fn restore_session(&self, id: &str) -> Result<Restore, ClientError> {
        let path = format!("/session/{id}");
        let mut attempts = 0;
        loop {
            let result = match self.send_authenticated(Method::PATCH, &path).await {
                Ok(resp) if resp.status() == StatusCode::NOT_FOUND => return Ok(Restore::Expired),
                Ok(resp) if resp.status().is_success() => return Ok(Restore::Alive),
                Ok(resp) => ClientError::Status(resp.status()),
                Err(err) => err,
            };
            attempts += 1;
            if self.retry.exhausted(attempts) {
                return Err(result);
            }
            let delay = self.retry.backoff(attempts);
            tracing::warn!(error = %result, attempts, delay_ms = delay.as_millis() as u64, "session restore failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }

    /// `POST /session`, retried with a fixed delay until it yields an id.
    pub async fn create_session(&self) -> Result<String, ClientError> {
        let mut attempts = 0;
        loop {
            match self.try_create_session().await {
                Ok(id) => {
                    tracing::info!(server = %self.endpoint.host(), "created session");
                    return Ok(id);
                }
                Err(err) => {
                    attempts += 1;
                    if self.retry.exhausted(attempts) {
                        return Err(err);
                    }
                    tracing::warn!(error = %err, attempts, "session create failed, retrying");
                    tokio::time::sleep(self.retry.base_delay).await;
                }
            }
        }
    }

    async fn try_create_session(&self) -> Result<String, ClientError> {
        let resp = self.send_authenticated(Method::POST, "/session").await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ClientError::Status(status));
        }
        let body = decode_json(resp.bytes().await?.to_vec())?;
        match body.get("id") {
            Some(JsonValue::String(id)) if !id.is_empty() => Ok(id.clone()),
            Some(JsonValue::Number(id)) => Ok(id.to_string()),
            _ => Err(ClientError::MissingSessionId),
        }
    }
}
