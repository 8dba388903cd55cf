//! Spreadsheet storage + HTTP fetch utilities for threadsheet.

use std::time::Duration;

use anyhow::Context;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

mod sheets;

pub use sheets::{
    quoted_range, GoogleSheetStore, GridRange, SheetError, SheetProperties, SheetRecord,
    SheetSnapshot, SheetStore, DEFAULT_SHEETS_API_BASE,
};

pub const CRATE_NAME: &str = "threadsheet-storage";

const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<reqwest::Error> for FetchError {
    /// The URL is dropped because query strings carry access tokens.
    fn from(err: reqwest::Error) -> Self {
        Self::Request(err.without_url())
    }
}

impl FetchError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status).ok(),
            Self::Request(err) => err.status(),
            Self::Decode { .. } => None,
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self.status(),
            Some(StatusCode::UNAUTHORIZED) | Some(StatusCode::FORBIDDEN)
        )
    }
}

/// Thin JSON client shared by the feed adapter and the sheet store.
///
/// Requests are issued one at a time by callers; there is no retry. Every
/// request is bounded by the configured timeout.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        bearer: Option<&str>,
    ) -> Result<T, FetchError> {
        let builder = self.client.get(url).query(query);
        self.execute(Method::GET, url, builder, bearer).await
    }

    pub async fn send_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, String)],
        bearer: Option<&str>,
        body: &B,
    ) -> Result<T, FetchError> {
        let builder = self
            .client
            .request(method.clone(), url)
            .query(query)
            .json(body);
        self.execute(method, url, builder, bearer).await
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        mut builder: RequestBuilder,
        bearer: Option<&str>,
    ) -> Result<T, FetchError> {
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }

        let span = info_span!("http_fetch", %method, url);
        async move {
            let resp = builder.send().await?;
            let status = resp.status();
            let final_url = redacted_url(resp.url());

            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                    body: truncate_body(&body),
                });
            }

            let bytes = resp.bytes().await?;
            debug!(status = status.as_u16(), bytes = bytes.len(), "response received");
            serde_json::from_slice(&bytes).map_err(|source| FetchError::Decode {
                url: final_url,
                source,
            })
        }
        .instrument(span)
        .await
    }
}

/// Drops the query string so access tokens never reach logs or error messages.
fn redacted_url(url: &reqwest::Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

fn truncate_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= ERROR_BODY_LIMIT {
        return trimmed.to_string();
    }
    let mut out = trimmed.chars().take(ERROR_BODY_LIMIT).collect::<String>();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value as JsonValue;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn redaction_strips_query_string() {
        let url = reqwest::Url::parse("https://graph.example/v1.0/me/threads?access_token=secret&limit=5")
            .unwrap();
        assert_eq!(redacted_url(&url), "https://graph.example/v1.0/me/threads");
    }

    #[test]
    fn error_bodies_are_truncated() {
        let long = "x".repeat(ERROR_BODY_LIMIT + 10);
        let out = truncate_body(&long);
        assert!(out.ends_with("..."));
        assert_eq!(out.chars().count(), ERROR_BODY_LIMIT + 3);
        assert_eq!(truncate_body("  short  "), "short");
    }

    #[tokio::test]
    async fn get_json_sends_query_and_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .and(query_param("limit", "5"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let value: JsonValue = http
            .get_json(
                &format!("{}/items", server.uri()),
                &[("limit", "5".to_string())],
                Some("tok"),
            )
            .await
            .unwrap();
        assert_eq!(value["ok"], JsonValue::Bool(true));
    }

    #[tokio::test]
    async fn non_success_status_is_not_retried_and_hides_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(401).set_body_string("{\"error\":\"expired\"}"))
            .expect(1)
            .mount(&server)
            .await;

        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let err = http
            .get_json::<JsonValue>(
                &format!("{}/items", server.uri()),
                &[("access_token", "secret".to_string())],
                None,
            )
            .await
            .unwrap_err();

        assert!(err.is_auth_failure());
        let message = err.to_string();
        assert!(message.contains("401"));
        assert!(message.contains("expired"));
        assert!(!message.contains("secret"));
    }

    #[tokio::test]
    async fn transport_errors_hide_token() {
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let err = http
            .get_json::<JsonValue>(
                "http://127.0.0.1:1/v1.0/me/threads",
                &[("access_token", "SECRET_TOKEN".to_string())],
                None,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Request(_)));
        let message = format!("{:#}", anyhow::Error::from(err));
        assert!(!message.contains("SECRET_TOKEN"), "{message}");
    }

    #[tokio::test]
    async fn malformed_json_is_a_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let err = http
            .get_json::<JsonValue>(&format!("{}/items", server.uri()), &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Decode { .. }));
    }
}
