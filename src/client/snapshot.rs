use super::{decode_json, ApiClient, ClientError};
use reqwest::header::COOKIE;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;

const SNAPSHOT_PATH: &str = "/data/snapshot";
const CURSOR_COOKIE: &str = "snap_recvTime";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Snapshot,
    /// Session rejected; a new one was created.
    Reauthenticated,
    /// 429 / 503 from the server.
    Throttled,
    Transport,
    Malformed,
    UnexpectedStatus(StatusCode),
}

#[derive(Debug, Clone)]
pub struct FetchResult {
    pub session: String,
    pub cursor: Option<i64>,
    /// Empty object unless `outcome` is `Snapshot`.
    pub snapshot: JsonValue,
    pub outcome: FetchOutcome,
}

impl FetchResult {
    fn empty(session: &str, cursor: Option<i64>, outcome: FetchOutcome) -> Self {
        Self {
            session: session.to_string(),
            cursor,
            snapshot: JsonValue::Object(Default::default()),
            outcome,
        }
    }
}

fn parse_cursor(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    raw.parse::<i64>()
        .ok()
        .or_else(|| raw.parse::<f64>().ok().filter(|v| v.is_finite()).map(|v| v as i64))
}

impl ApiClient {
    /// One `GET /data/snapshot` since `cursor`.
    ///
    /// Only a failure to create a replacement session is an error; every
    /// other problem yields an empty snapshot with the cursor unchanged.
    pub async fn fetch_snapshot(
        &self,
        session: &str,
        cursor: Option<i64>,
    ) -> Result<FetchResult, ClientError> {
        let url = self.endpoint.url(SNAPSHOT_PATH)?;
        let mut cookie = format!("sessionid={session}");
        if let Some(last) = cursor {
            cookie.push_str(&format!("; {CURSOR_COOKIE}={last}"));
        }

        let resp = match self.http.get(url).header(COOKIE, cookie).send().await {
            Ok(resp) => resp,
            Err(err) => {
                tracing::warn!(error = %err, "snapshot request failed");
                return Ok(FetchResult::empty(session, cursor, FetchOutcome::Transport));
            }
        };

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            tracing::warn!(%status, "snapshot rejected the session, creating a new one");
            let fresh = self.create_session().await?;
            return Ok(FetchResult::empty(&fresh, cursor, FetchOutcome::Reauthenticated));
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
            tracing::warn!(%status, "server asked us to slow down");
            return Ok(FetchResult::empty(session, cursor, FetchOutcome::Throttled));
        }
        if !status.is_success() {
            tracing::warn!(%status, "unexpected snapshot status");
            return Ok(FetchResult::empty(
                session,
                cursor,
                FetchOutcome::UnexpectedStatus(status),
            ));
        }

        let next_cursor = resp
            .cookies()
            .find(|c| c.name() == CURSOR_COOKIE)
            .and_then(|c| parse_cursor(c.value()));

        let bytes = match resp.bytes().await {
            Ok(bytes) => bytes.to_vec(),
            Err(err) => {
                tracing::warn!(error = %err, "failed reading snapshot body");
                return Ok(FetchResult::empty(session, cursor, FetchOutcome::Transport));
            }
        };
        let snapshot = match decode_json(bytes) {
            Ok(value @ JsonValue::Object(_)) => value,
            Ok(other) => {
                tracing::warn!(kind = json_kind(&other), "snapshot body is not an object");
                return Ok(FetchResult::empty(session, cursor, FetchOutcome::Malformed));
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to decode snapshot");
                return Ok(FetchResult::empty(session, cursor, FetchOutcome::Malformed));
            }
        };

        Ok(FetchResult {
            session: session.to_string(),
            cursor: next_cursor.or(cursor),
            snapshot,
            outcome: FetchOutcome::Snapshot,
        })
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::auth::Credentials;
    use crate::client::test_server::spawn;
    use crate::client::{Endpoint, RetryPolicy};
    use axum::http::{header, HeaderMap};
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;
    use std::time::Duration;

    fn session_of(headers: &HeaderMap) -> String {
        headers
            .get(header::COOKIE)
            .and_then(|v| v.to_str().ok())
            .and_then(|cookies| {
                cookies
                    .split(';')
                    .map(str::trim)
                    .find_map(|kv| kv.strip_prefix("sessionid="))
            })
            .unwrap_or_default()
            .to_string()
    }

    async fn snapshot(headers: HeaderMap) -> Response {
        let cookie = headers
            .get(header::COOKIE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        match session_of(&headers).as_str() {
            "expired" => StatusCode::UNAUTHORIZED.into_response(),
            "busy" => StatusCode::SERVICE_UNAVAILABLE.into_response(),
            "garbage" => (StatusCode::OK, "<html>oops</html>").into_response(),
            "nocookie" => Json(json!({"ALMA": {"data": {}}})).into_response(),
            _ => {
                let body = json!({
                    "ALMA": {"data": {"telescope_sourceName": [1700000090, "M87"]}},
                    "echo": {"data": {"cookie": [1700000090, cookie]}}
                });
                (
                    [(header::SET_COOKIE, "snap_recvTime=1700000100; Path=/")],
                    Json(body),
                )
                    .into_response()
            }
        }
    }

    async fn base() -> String {
        let app = Router::new()
            .route("/data/snapshot", get(snapshot))
            .route("/session", post(|| async { Json(json!({"id": "renewed"})) }));
        spawn(app).await
    }

    fn client(base: &str) -> ApiClient {
        ApiClient::new(
            Endpoint::parse(base).unwrap(),
            Credentials::Basic {
                username: "u".into(),
                password: "p".into(),
            },
            Duration::from_secs(5),
            RetryPolicy {
                base_delay: Duration::from_millis(5),
                max_attempts: Some(2),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn success_advances_cursor_from_cookie_and_echoes_it() {
        let base = base().await;
        let result = client(&base).fetch_snapshot("good", Some(42)).await.unwrap();
        assert_eq!(result.outcome, FetchOutcome::Snapshot);
        assert_eq!(result.session, "good");
        assert_eq!(result.cursor, Some(1_700_000_100));
        assert!(result.snapshot.get("ALMA").is_some());
        let echoed = result.snapshot["echo"]["data"]["cookie"][1].as_str().unwrap();
        assert!(echoed.contains("sessionid=good"));
        assert!(echoed.contains("snap_recvTime=42"));
    }

    #[tokio::test]
    async fn missing_cookie_keeps_cursor() {
        let base = base().await;
        let result = client(&base).fetch_snapshot("nocookie", Some(7)).await.unwrap();
        assert_eq!(result.outcome, FetchOutcome::Snapshot);
        assert_eq!(result.cursor, Some(7));
    }

    #[tokio::test]
    async fn unauthorized_creates_new_session_and_keeps_cursor() {
        let base = base().await;
        let result = client(&base).fetch_snapshot("expired", Some(42)).await.unwrap();
        assert_eq!(result.outcome, FetchOutcome::Reauthenticated);
        assert_eq!(result.session, "renewed");
        assert_eq!(result.cursor, Some(42));
        assert_eq!(result.snapshot, json!({}));
    }

    #[tokio::test]
    async fn service_unavailable_is_empty() {
        let base = base().await;
        let result = client(&base).fetch_snapshot("busy", None).await.unwrap();
        assert_eq!(result.outcome, FetchOutcome::Throttled);
        assert_eq!(result.session, "busy");
        assert_eq!(result.cursor, None);
        assert_eq!(result.snapshot, json!({}));
    }

    #[tokio::test]
    async fn malformed_body_is_empty() {
        let base = base().await;
        let result = client(&base).fetch_snapshot("garbage", Some(3)).await.unwrap();
        assert_eq!(result.outcome, FetchOutcome::Malformed);
        assert_eq!(result.cursor, Some(3));
    }

    #[tokio::test]
    async fn transport_error_is_empty() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = client(&format!("http://{addr}"))
            .fetch_snapshot("any", Some(9))
            .await
            .unwrap();
        assert_eq!(result.outcome, FetchOutcome::Transport);
        assert_eq!(result.cursor, Some(9));
    }

    #[test]
    fn cursor_cookie_accepts_fractional_seconds() {
        assert_eq!(parse_cursor("1700000100"), Some(1_700_000_100));
        assert_eq!(parse_cursor("1700000100.75"), Some(1_700_000_100));
        assert_eq!(parse_cursor("soon"), None);
    }
}
