use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use captionify_contracts::event_payload;
use captionify_contracts::events::EventWriter;
use serde_json::Value;
use tracing::{debug, warn};

use crate::transport::{
    InvokeRequest, Transport, TransportError, TransportErrorKind, TransportResponse,
};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_ATTEMPT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_TRANSIENT_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_UNAVAILABLE_BACKOFF_MS: u64 = 2_000;

const ERROR_TEXT_MAX_CHARS: usize = 512;

/// Models that are still loading answer 503 until they are warm.
pub fn is_service_unavailable(status: u16) -> bool {
    status == 503
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub attempt_timeout: Duration,
    pub transient_backoff: Duration,
    pub unavailable_backoff: Duration,
    pub retryable_status: fn(u16) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            attempt_timeout: Duration::from_millis(DEFAULT_ATTEMPT_TIMEOUT_MS),
            transient_backoff: Duration::from_millis(DEFAULT_TRANSIENT_BACKOFF_MS),
            unavailable_backoff: Duration::from_millis(DEFAULT_UNAVAILABLE_BACKOFF_MS),
            retryable_status: is_service_unavailable,
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvokeError {
    #[error("service unavailable (HTTP {status}) after {attempts} attempt(s): {message}")]
    ServiceUnavailable {
        attempts: u32,
        status: u16,
        message: String,
    },
    #[error("transient failure after {attempts} attempt(s): {message}")]
    Transient { attempts: u32, message: String },
    #[error("request failed after {attempts} attempt(s): {message}")]
    Fatal {
        attempts: u32,
        status: Option<u16>,
        message: String,
    },
}

impl InvokeError {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::ServiceUnavailable { attempts, .. }
            | Self::Transient { attempts, .. }
            | Self::Fatal { attempts, .. } => *attempts,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::ServiceUnavailable { message, .. }
            | Self::Transient { message, .. }
            | Self::Fatal { message, .. } => message,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::Transient { .. } => "transient",
            Self::Fatal { .. } => "fatal",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum AttemptOutcome {
    Success(Value),
    ServiceUnavailable { status: u16, message: String },
    Transient { message: String },
    Fatal { status: Option<u16>, message: String },
}

fn classify(
    result: Result<TransportResponse, TransportError>,
    policy: &RetryPolicy,
) -> AttemptOutcome {
    let response = match result {
        Ok(response) => response,
        Err(err) if err.is_retryable() => {
            return AttemptOutcome::Transient {
                message: err.message,
            }
        }
        Err(err) => {
            return AttemptOutcome::Fatal {
                status: None,
                message: err.message,
            }
        }
    };

    let status = response.status;
    if (200..300).contains(&status) {
        return match serde_json::from_slice::<Value>(&response.body) {
            Ok(value) => AttemptOutcome::Success(value),
            Err(err) => AttemptOutcome::Fatal {
                status: Some(status),
                message: format!("response was not valid JSON: {err}"),
            },
        };
    }

    let message = upstream_error_text(status, &response.body);
    if (policy.retryable_status)(status) {
        AttemptOutcome::ServiceUnavailable { status, message }
    } else {
        AttemptOutcome::Fatal {
            status: Some(status),
            message,
        }
    }
}

fn upstream_error_text(status: u16, body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let detail = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|payload| match payload.get("error") {
            Some(Value::String(message)) => Some(message.clone()),
            Some(other) => other
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
            None => None,
        })
        .unwrap_or_else(|| text.trim().to_string());
    let detail = detail.trim();
    if detail.is_empty() {
        return format!("HTTP {status}");
    }
    truncate_text(detail, ERROR_TEXT_MAX_CHARS)
}

pub(crate) fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(max_chars).collect();
    clipped.push('…');
    clipped
}

/// Runs one logical request against a [`Transport`] with deadlines and
/// bounded retries.
#[derive(Clone)]
pub struct Invoker {
    transport: Arc<dyn Transport>,
    events: Option<EventWriter>,
}

impl Invoker {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Option<EventWriter>) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> Option<&EventWriter> {
        self.events.as_ref()
    }

    /// Total attempts never exceed `policy.max_attempts()`. Fatal outcomes
    /// return after the attempt that produced them.
    #[tracing::instrument(name = "Invoker::invoke", skip_all, fields(label = %request.label))]
    pub async fn invoke(
        &self,
        request: &InvokeRequest,
        policy: &RetryPolicy,
    ) -> Result<Value, InvokeError> {
        let max_attempts = policy.max_attempts();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(
                policy.attempt_timeout,
                self.transport.send(request, policy.attempt_timeout),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::new(
                    TransportErrorKind::Timeout,
                    format!(
                        "no response within {} ms",
                        policy.attempt_timeout.as_millis()
                    ),
                )),
            };

            let (delay, failure) = match classify(result, policy) {
                AttemptOutcome::Success(value) => {
                    debug!(attempt, "request succeeded");
                    return Ok(value);
                }
                AttemptOutcome::Fatal { status, message } => {
                    return Err(InvokeError::Fatal {
                        attempts: attempt,
                        status,
                        message,
                    });
                }
                AttemptOutcome::ServiceUnavailable { status, message } => (
                    policy.unavailable_backoff,
                    InvokeError::ServiceUnavailable {
                        attempts: attempt,
                        status,
                        message,
                    },
                ),
                AttemptOutcome::Transient { message } => (
                    policy.transient_backoff,
                    InvokeError::Transient {
                        attempts: attempt,
                        message,
                    },
                ),
            };

            if attempt >= max_attempts {
                return Err(failure);
            }

            self.note_retry(request, max_attempts, delay, &failure);
            tokio::time::sleep(delay).await;
        }
    }

    fn note_retry(
        &self,
        request: &InvokeRequest,
        max_attempts: u32,
        delay: Duration,
        failure: &InvokeError,
    ) {
        let attempt = failure.attempts();
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        warn!(
            attempt,
            max_attempts,
            delay_ms,
            reason = failure.reason(),
            "{}; retrying",
            failure.message()
        );
        let Some(events) = self.events.as_ref() else {
            return;
        };
        let emitted = events.emit(
            "invoke_retry",
            event_payload! {
                "label" => request.label,
                "attempt" => attempt,
                "max_attempts" => max_attempts,
                "reason" => failure.reason(),
                "delay_ms" => delay_ms,
                "message" => failure.message(),
            },
        );
        if let Err(err) = emitted {
            warn!("failed to write invoke_retry event: {err:#}");
        }
    }
}

impl fmt::Debug for Invoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invoker")
            .field("events", &self.events.as_ref().map(EventWriter::path))
            .finish_non_exhaustive()
    }
}
