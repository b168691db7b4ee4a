//! Partner API client.
//!
//! Performs the session handshake, then lists exams page by page. Every
//! call carries a bounded timeout; transient network failures (timeouts,
//! connection errors, 5xx) are retried exactly once after a short jittered
//! delay. Business errors are never retried.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::sync::provider::{ExamPage, ExamSource};

/// Base delay before the single retry of a transient failure.
const RETRY_BASE_DELAY_MS: u64 = 250;

/// Errors from the partner API.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PartnerError {
    /// Credentials or token rejected. Fatal to a sync cycle.
    #[error("Partner rejected credentials: {message}")]
    Unauthorized { message: String },

    /// Timeout, connection failure or 5xx.
    #[error("Transient partner failure: {message}")]
    Transient { message: String },

    /// Any other non-success response.
    #[error("Partner rejected request with HTTP {status}")]
    Rejected { status: u16 },

    #[error("Malformed partner response: {message}")]
    Malformed { message: String },
}

impl PartnerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PartnerError::Transient { .. })
    }
}

fn classify_reqwest(err: reqwest::Error) -> PartnerError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        PartnerError::Transient { message: err.to_string() }
    } else if err.is_decode() {
        PartnerError::Malformed { message: err.to_string() }
    } else {
        PartnerError::Transient { message: err.to_string() }
    }
}

fn classify_status(status: StatusCode) -> Option<PartnerError> {
    if status.is_success() {
        None
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Some(PartnerError::Unauthorized {
            message: format!("Partner returned HTTP {}", status),
        })
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Some(PartnerError::Transient {
            message: format!("Partner returned HTTP {}", status),
        })
    } else {
        Some(PartnerError::Rejected { status: status.as_u16() })
    }
}

/// Connection settings for the partner API.
#[derive(Debug, Clone)]
pub struct PartnerSettings {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub account_id: String,
    pub timeout: Duration,
}

#[derive(Debug, Serialize)]
struct SessionRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    token: String,
}

/// Exam listing response. Unknown fields are ignored.
#[derive(Debug, Deserialize)]
struct ExamListResponse {
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    exams: Vec<Value>,
}

pub struct PartnerClient {
    settings: PartnerSettings,
    http: Client,
    token: RwLock<Option<String>>,
}

impl PartnerClient {
    pub fn new(settings: PartnerSettings) -> Result<Self, PartnerError> {
        let http = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| PartnerError::Malformed { message: e.to_string() })?;

        Ok(Self {
            settings,
            http,
            token: RwLock::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.settings.base_url
    }

    /// Send a request, retrying once when the failure is transient.
    async fn send_with_retry<F>(&self, build: F) -> Result<Response, PartnerError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match build().send().await {
                Ok(response) => match classify_status(response.status()) {
                    None => Ok(response),
                    Some(err) => Err(err),
                },
                Err(err) => Err(classify_reqwest(err)),
            };

            match result {
                Err(err) if err.is_transient() && attempt == 1 => {
                    let jitter = rand::thread_rng().gen_range(0..RETRY_BASE_DELAY_MS);
                    let delay = Duration::from_millis(RETRY_BASE_DELAY_MS + jitter);
                    tracing::warn!("Partner call failed ({}), retrying once in {:?}", err, delay);
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Session handshake. The token is cached for later calls.
    pub async fn authenticate(&self) -> Result<String, PartnerError> {
        let url = format!("{}/v2/sessions", self.settings.base_url);
        let body = SessionRequest {
            username: &self.settings.username,
            password: &self.settings.password,
        };

        let response = self
            .send_with_retry(|| self.http.post(&url).json(&body))
            .await?;

        let session = response
            .json::<SessionResponse>()
            .await
            .map_err(|e| PartnerError::Malformed { message: e.to_string() })?;

        *self.token.write().await = Some(session.token.clone());
        tracing::debug!("Partner session established");
        Ok(session.token)
    }

    /// The cached token, or a fresh one. The flag is `true` when cached.
    async fn token(&self) -> Result<(String, bool), PartnerError> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok((token, true));
        }
        Ok((self.authenticate().await?, false))
    }

    /// List one page of exams for the configured partner account.
    ///
    /// A cached token that the partner refuses is treated as an expired
    /// session: the handshake is repeated once and the page requested again.
    /// Only a refused handshake or a refused fresh token is fatal.
    pub async fn list_exams(&self, offset: u32, limit: u32) -> Result<ExamPage, PartnerError> {
        let (token, cached) = self.token().await?;

        match self.request_page(&token, offset, limit).await {
            Err(PartnerError::Unauthorized { .. }) if cached => {
                tracing::info!("Partner refused cached session token, re-authenticating");
                let fresh = self.authenticate().await?;
                self.request_page(&fresh, offset, limit).await
            }
            other => other,
        }
    }

    async fn request_page(&self, token: &str, offset: u32, limit: u32) -> Result<ExamPage, PartnerError> {
        let url = format!(
            "{}/v2/partners/{}/exams",
            self.settings.base_url, self.settings.account_id
        );

        let response = self
            .send_with_retry(|| {
                self.http
                    .get(&url)
                    .bearer_auth(token)
                    .query(&[("offset", offset), ("limit", limit)])
            })
            .await;

        let response = match response {
            Err(err @ PartnerError::Unauthorized { .. }) => {
                // A stale token must not be reused by the next cycle.
                *self.token.write().await = None;
                return Err(err);
            }
            other => other?,
        };

        let list = response
            .json::<ExamListResponse>()
            .await
            .map_err(|e| PartnerError::Malformed { message: e.to_string() })?;

        Ok(ExamPage {
            total: list.total,
            exams: list.exams,
        })
    }
}

#[async_trait]
impl ExamSource for PartnerClient {
    async fn fetch_exam_page(&self, offset: u32, limit: u32) -> Result<ExamPage, PartnerError> {
        self.list_exams(offset, limit).await
    }

    fn source_name(&self) -> &str {
        "partner-api"
    }
}
