//! Remote store served over HTTP.
//!
//! Routes:
//! - `PUT {endpoint}/v1/records/{id}` with the sealed record as JSON; 409 when
//!   the server keeps its copy, 410 when the upload would revive a tombstone
//! - `PUT {endpoint}/v1/records/{id}/envelope` replacing the payload at the
//!   same version; 409 when the stored version differs
//! - `GET {endpoint}/v1/records?since={watermark}` returning `{records, watermark}`

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::models::Record;
use crate::store::{ChangePage, RemoteStore};
use crate::util::{compact_text, is_http_url, normalize_text_option};

#[derive(Clone)]
pub struct HttpRemoteStore {
    endpoint: String,
    client: reqwest::Client,
    bearer_token: Option<String>,
}

impl std::fmt::Debug for HttpRemoteStore {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpRemoteStore")
            .field("endpoint", &self.endpoint)
            .field(
                "bearer_token",
                &self.bearer_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish_non_exhaustive()
    }
}

impl HttpRemoteStore {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let endpoint = normalize_endpoint(endpoint.into())?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            endpoint,
            client,
            bearer_token: None,
        })
    }

    #[must_use]
    pub fn with_bearer_token(mut self, token: Option<String>) -> Self {
        self.bearer_token = normalize_text_option(token);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn records_url(&self) -> String {
        format!("{}/v1/records", self.endpoint)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn put(&self, record: &Record) -> Result<()> {
        let url = format!("{}/{}", self.records_url(), record.id);
        let response = self
            .authorize(self.client.put(&url))
            .header("Accept", "application/json")
            .json(record)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        // The server already holds this version or a newer one.
        if status == StatusCode::CONFLICT {
            tracing::debug!(record_id = %record.id, version = record.version, "Remote kept its newer copy");
            return Ok(());
        }
        if status == StatusCode::GONE {
            return Err(Error::RemoteTombstoned(record.id.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body))
    }

    async fn rewrap(&self, record: &Record) -> Result<bool> {
        let url = format!("{}/{}/envelope", self.records_url(), record.id);
        let response = self
            .authorize(self.client.put(&url))
            .header("Accept", "application/json")
            .json(record)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }
        if status == StatusCode::CONFLICT || status == StatusCode::NOT_FOUND {
            return Ok(false);
        }

        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body))
    }

    async fn fetch_changed_since(&self, watermark: Option<i64>) -> Result<ChangePage> {
        let mut request = self
            .authorize(self.client.get(self.records_url()))
            .header("Accept", "application/json");
        if let Some(since) = watermark {
            request = request.query(&[("since", since)]);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        let payload: ChangePageResponse = serde_json::from_str(&body).map_err(|e| {
            Error::RemoteRejected(format!("invalid change page: {e}"))
        })?;
        Ok(ChangePage {
            records: payload.records,
            watermark: payload.watermark.or(watermark),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChangePageResponse {
    #[serde(default)]
    records: Vec<Record>,
    watermark: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn transport_error(error: reqwest::Error) -> Error {
    Error::RemoteTransient(error.to_string())
}

/// Map a non-success status onto the sync error taxonomy
fn status_error(status: StatusCode, body: &str) -> Error {
    let message = parse_api_error(status, body);
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        Error::RemoteTransient(message)
    } else {
        Error::RemoteRejected(message)
    }
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn normalize_endpoint(raw: String) -> Result<String> {
    let endpoint = normalize_text_option(Some(raw))
        .ok_or_else(|| Error::Config("remote endpoint must not be empty".to_string()))?;
    if is_http_url(&endpoint) {
        Ok(endpoint.trim_end_matches('/').to_string())
    } else {
        Err(Error::Config(
            "remote endpoint must include http:// or https://".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn normalize_endpoint_rejects_invalid_values() {
        assert!(normalize_endpoint(String::new()).is_err());
        assert!(normalize_endpoint("   ".to_string()).is_err());
        assert!(normalize_endpoint("sync.example.com".to_string()).is_err());
    }

    #[test]
    fn normalize_endpoint_trims_trailing_slash() {
        assert_eq!(
            normalize_endpoint(" https://sync.example.com/ ".to_string()).unwrap(),
            "https://sync.example.com"
        );
    }

    #[test]
    fn records_url_is_versioned() {
        let store = HttpRemoteStore::new("http://localhost:8080/").unwrap();
        assert_eq!(store.records_url(), "http://localhost:8080/v1/records");
    }

    #[test]
    fn api_error_prefers_message_field() {
        let body = r#"{"error":"bad_request","message":"payload must be sealed"}"#;
        assert_eq!(
            parse_api_error(StatusCode::BAD_REQUEST, body),
            "payload must be sealed (400)"
        );
        assert_eq!(
            parse_api_error(StatusCode::BAD_GATEWAY, "  "),
            "HTTP 502"
        );
        assert_eq!(
            parse_api_error(StatusCode::FORBIDDEN, "nope"),
            "nope (403)"
        );
    }

    #[test]
    fn server_errors_are_transient_client_errors_are_rejected() {
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE, "").is_retryable());
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(matches!(
            status_error(StatusCode::UNPROCESSABLE_ENTITY, ""),
            Error::RemoteRejected(_)
        ));
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, ""),
            Error::RemoteRejected(_)
        ));
    }

    #[test]
    fn debug_redacts_bearer_token() {
        let store = HttpRemoteStore::new("https://sync.example.com")
            .unwrap()
            .with_bearer_token(Some("secret-token".to_string()));
        let debug = format!("{store:?}");
        assert!(!debug.contains("secret-token"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn change_page_tolerates_missing_records() {
        let page: ChangePageResponse = serde_json::from_str(r#"{"watermark":7}"#).unwrap();
        assert!(page.records.is_empty());
        assert_eq!(page.watermark, Some(7));
    }
}
