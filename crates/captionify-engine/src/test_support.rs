use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::transport::{
    InvokeRequest, RequestBody, Transport, TransportError, TransportErrorKind, TransportResponse,
};

#[derive(Debug, Clone)]
pub(crate) enum Scripted {
    Respond { status: u16, body: String },
    Fail(TransportErrorKind),
    /// Never answers; only the invoker's deadline ends the attempt.
    Hang,
}

impl Scripted {
    pub(crate) fn status(status: u16, body: &str) -> Self {
        Self::Respond {
            status,
            body: body.to_string(),
        }
    }

    pub(crate) fn json(status: u16, body: Value) -> Self {
        Self::Respond {
            status,
            body: body.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub label: String,
    pub url: String,
    pub bearer: Option<String>,
    pub body: RequestBody,
}

/// In-memory [`Transport`] that replays a script and records every send.
#[derive(Debug)]
pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    repeat: Option<Scripted>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedTransport {
    pub(crate) fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            repeat: None,
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Answers every call with `entry`.
    pub(crate) fn repeating(entry: Scripted) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            repeat: Some(entry),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub(crate) fn calls_labelled(&self, label: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.label == label)
            .count()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        request: &InvokeRequest,
        _timeout: Duration,
    ) -> Result<TransportResponse, TransportError> {
        self.calls.lock().unwrap().push(RecordedCall {
            label: request.label.clone(),
            url: request.url.clone(),
            bearer: request.bearer.clone(),
            body: request.body.clone(),
        });
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.repeat.clone());
        match next {
            Some(Scripted::Respond { status, body }) => Ok(TransportResponse {
                status,
                body: body.into_bytes(),
            }),
            Some(Scripted::Fail(kind)) => Err(TransportError::new(kind, "scripted failure")),
            Some(Scripted::Hang) => {
                std::future::pending::<Result<TransportResponse, TransportError>>().await
            }
            None => Ok(TransportResponse {
                status: 500,
                body: br#"{"error":"script exhausted"}"#.to_vec(),
            }),
        }
    }
}
