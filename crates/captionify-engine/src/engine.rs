use std::sync::Arc;

use anyhow::Result;
use captionify_contracts::caption::{CaptionResult, ImagePayload};
use captionify_contracts::event_payload;
use captionify_contracts::events::{EventPayload, EventWriter};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::backends::{GradioSpaceConnector, InferenceApiConnector, TextGenerationBackend};
use crate::config::{CaptionBackend, EngineConfig};
use crate::error::{PipelineError, Precondition};
use crate::invoker::Invoker;
use crate::pipeline::{CaptionPipeline, PipelineConfig};
use crate::run::PipelineRun;
use crate::session::{Readiness, SessionConnector, SessionManager};
use crate::transport::{HttpTransport, Transport};

/// Caller-facing entry point: owns the session and runs captions through
/// the two-stage pipeline, one run at a time.
#[derive(Debug)]
pub struct CaptionEngine {
    session: SessionManager,
    pipeline: CaptionPipeline,
    events: Option<EventWriter>,
    run_gate: Mutex<()>,
}

impl CaptionEngine {
    pub fn from_config(config: &EngineConfig, events: Option<EventWriter>) -> Result<Self> {
        Self::with_transport(config, Arc::new(HttpTransport::new()?), events)
    }

    pub fn with_transport(
        config: &EngineConfig,
        transport: Arc<dyn Transport>,
        events: Option<EventWriter>,
    ) -> Result<Self> {
        let connector: Arc<dyn SessionConnector> = match &config.caption_backend {
            CaptionBackend::InferenceApi => Arc::new(InferenceApiConnector::new(
                config.api_base.as_str(),
                config.caption_model.as_str(),
                config.api_key.clone(),
            )),
            CaptionBackend::GradioSpace { url } => Arc::new(
                GradioSpaceConnector::new(url.as_str(), config.api_key.clone()).with_lengths(
                    config.description_min_length,
                    config.description_max_length,
                ),
            ),
        };
        Self::with_parts(config, transport, connector, events)
    }

    pub fn with_parts(
        config: &EngineConfig,
        transport: Arc<dyn Transport>,
        connector: Arc<dyn SessionConnector>,
        events: Option<EventWriter>,
    ) -> Result<Self> {
        let invoker = Invoker::new(transport).with_events(events.clone());
        let generator = TextGenerationBackend::new(
            &config.api_base,
            &config.text_model,
            config.api_key.clone(),
            config.generation.clone(),
        )?;
        let session = SessionManager::new(connector, invoker.clone(), config.retry)
            .with_events(events.clone());
        let pipeline = CaptionPipeline::new(
            invoker,
            generator,
            PipelineConfig {
                describe_policy: config.retry,
                generate_policy: config.retry,
                max_caption_chars: config.max_caption_chars,
                language: config.language.clone(),
            },
        );
        Ok(Self {
            session,
            pipeline,
            events,
            run_gate: Mutex::new(()),
        })
    }

    pub fn pipeline(&self) -> &CaptionPipeline {
        &self.pipeline
    }

    pub fn backend(&self) -> &str {
        self.session.backend()
    }

    /// Connects the captioning session. While another call is still
    /// connecting this returns `SessionNotReady(Connecting)` without waiting
    /// for it.
    pub async fn initialize_session(&self) -> Result<(), PipelineError> {
        match self.session.initialize().await {
            Readiness::Ready => Ok(()),
            Readiness::Failed(reason) => Err(PipelineError::SessionInitFailed(reason)),
            other => Err(PipelineError::PreconditionFailed(
                Precondition::SessionNotReady(other),
            )),
        }
    }

    pub fn current_readiness(&self) -> Readiness {
        self.session.readiness()
    }

    pub async fn generate_caption(
        &self,
        image: Option<ImagePayload>,
        tone: Option<&str>,
    ) -> Result<CaptionResult, PipelineError> {
        let mut run = PipelineRun::new(image, tone);
        self.execute(&mut run).await
    }

    /// Drives `run` from Idle to a terminal state. Rejected runs never touch
    /// the network and stay Idle.
    #[tracing::instrument(name = "CaptionEngine::execute", skip_all, fields(run_id = %run.id()))]
    pub async fn execute(&self, run: &mut PipelineRun) -> Result<CaptionResult, PipelineError> {
        let Ok(_gate) = self.run_gate.try_lock() else {
            return Err(PipelineError::PreconditionFailed(Precondition::RunInProgress));
        };
        run.start(&self.session.readiness())?;
        self.emit(run, "run_started", self.run_started_payload(run));

        let outcome = match self.session.handle() {
            Ok(handle) => match run.image() {
                Some(image) => {
                    self.pipeline
                        .synthesize(handle.as_ref(), image, run.tone())
                        .await
                }
                None => Err(PipelineError::PreconditionFailed(Precondition::MissingImage)),
            },
            Err(readiness) => Err(PipelineError::PreconditionFailed(
                Precondition::SessionNotReady(readiness),
            )),
        };
        run.finish(&outcome);

        let elapsed_ms = run
            .elapsed()
            .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        match &outcome {
            Ok(result) => {
                info!(elapsed_ms, chars = result.char_count(), "caption ready");
                self.emit(
                    run,
                    "run_succeeded",
                    event_payload! {
                        "description" => result.description.as_str(),
                        "caption" => result.text,
                        "chars" => result.char_count(),
                        "elapsed_ms" => elapsed_ms,
                    },
                );
            }
            Err(err) => {
                warn!(elapsed_ms, kind = err.kind().as_str(), "caption run failed: {err}");
                let mut payload = event_payload! {
                    "error_kind" => err.kind().as_str(),
                    "error" => err.to_string(),
                    "elapsed_ms" => elapsed_ms,
                };
                if let Some(stage) = err.stage() {
                    payload.insert("stage".to_string(), stage.as_str().into());
                }
                self.emit(run, "run_failed", payload);
            }
        }
        outcome
    }

    pub fn shutdown(&self) {
        self.session.shutdown();
        info!("caption session shut down");
    }

    fn run_started_payload(&self, run: &PipelineRun) -> EventPayload {
        let mut payload = event_payload! {
            "tone" => run.tone().as_str(),
            "backend" => self.session.backend(),
            "text_model" => self.pipeline.generator().model(),
        };
        if let Some(image) = run.image() {
            payload.insert("mime_type".to_string(), image.mime_type().into());
            payload.insert("image_bytes".to_string(), image.size().into());
            payload.insert("image_sha256".to_string(), image_fingerprint(image).into());
        }
        payload
    }

    fn emit(&self, run: &PipelineRun, event_type: &str, mut payload: EventPayload) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        payload.insert("run_id".to_string(), run.id().to_string().into());
        if let Err(err) = events.emit(event_type, payload) {
            warn!("failed to write {event_type} event: {err:#}");
        }
    }
}

fn image_fingerprint(image: &ImagePayload) -> String {
    let digest = Sha256::digest(image.bytes());
    hex::encode(&digest[..8])
}
