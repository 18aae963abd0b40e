use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client as HttpClient, Method};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Bytes { content_type: String, data: Vec<u8> },
    Json(Value),
}

/// One logical request. The invoker may send it several times.
#[derive(Clone)]
pub struct InvokeRequest {
    /// Short name used in logs and events (`describe`, `generate`, ...).
    pub label: String,
    pub method: Method,
    pub url: String,
    pub bearer: Option<String>,
    pub body: RequestBody,
}

impl InvokeRequest {
    pub fn get(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            method: Method::GET,
            url: url.into(),
            bearer: None,
            body: RequestBody::Empty,
        }
    }

    pub fn post_json(label: impl Into<String>, url: impl Into<String>, payload: Value) -> Self {
        Self {
            label: label.into(),
            method: Method::POST,
            url: url.into(),
            bearer: None,
            body: RequestBody::Json(payload),
        }
    }

    pub fn post_bytes(
        label: impl Into<String>,
        url: impl Into<String>,
        content_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            label: label.into(),
            method: Method::POST,
            url: url.into(),
            bearer: None,
            body: RequestBody::Bytes {
                content_type: content_type.into(),
                data,
            },
        }
    }

    pub fn with_bearer(mut self, token: Option<&str>) -> Self {
        self.bearer = token
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        self
    }
}

impl fmt::Debug for InvokeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvokeRequest")
            .field("label", &self.label)
            .field("method", &self.method)
            .field("url", &self.url)
            .field("bearer", &self.bearer.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Request,
    Body,
    /// The request could not be built (bad URL, bad header). Retrying cannot help.
    Builder,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind != TransportErrorKind::Builder
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::Connect
        } else if err.is_builder() {
            TransportErrorKind::Builder
        } else if err.is_body() || err.is_decode() {
            TransportErrorKind::Body
        } else {
            TransportErrorKind::Request
        };
        Self::new(kind, error_chain_text(&err))
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: &InvokeRequest,
        timeout: Duration,
    ) -> std::result::Result<TransportResponse, TransportError>;
}

/// [`Transport`] over a shared async `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: HttpClient,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let http = HttpClient::builder()
            .user_agent(concat!("captionify/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        request: &InvokeRequest,
        timeout: Duration,
    ) -> std::result::Result<TransportResponse, TransportError> {
        let mut builder = self
            .http
            .request(request.method.clone(), request.url.as_str())
            .timeout(timeout);
        if let Some(token) = request.bearer.as_deref() {
            builder = builder.bearer_auth(token);
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Bytes { content_type, data } => builder
                .header(CONTENT_TYPE, content_type.as_str())
                .body(data.clone()),
            RequestBody::Json(payload) => builder.json(payload),
        };

        let response = builder.send().await.map_err(TransportError::from_reqwest)?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(TransportError::from_reqwest)?;
        Ok(TransportResponse {
            status,
            body: body.to_vec(),
        })
    }
}

fn error_chain_text(err: &(dyn StdError + 'static)) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut current = Some(err);
    while let Some(cause) = current {
        let text = cause.to_string();
        let trimmed = text.trim();
        if !trimmed.is_empty() && parts.last().map(|last| last != trimmed).unwrap_or(true) {
            parts.push(trimmed.to_string());
        }
        current = cause.source();
    }
    parts.join(" | caused by: ")
}
