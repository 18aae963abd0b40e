use std::time::{Duration, Instant};

use captionify_contracts::caption::{CaptionResult, ImagePayload, Tone};
use uuid::Uuid;

use crate::error::{PipelineError, Precondition};
use crate::session::Readiness;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Succeeded(CaptionResult),
    Failed(PipelineError),
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Succeeded(_) => "succeeded",
            Self::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded(_) | Self::Failed(_))
    }
}

/// One user action: image + tone in, caption or classified error out.
#[derive(Debug)]
pub struct PipelineRun {
    id: Uuid,
    image: Option<ImagePayload>,
    tone: Tone,
    state: RunState,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

impl PipelineRun {
    pub fn new(image: Option<ImagePayload>, tone: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4(),
            image,
            tone: Tone::new(tone),
            state: RunState::Idle,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn image(&self) -> Option<&ImagePayload> {
        self.image.as_ref()
    }

    pub fn tone(&self) -> &Tone {
        &self.tone
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn elapsed(&self) -> Option<Duration> {
        let started = self.started_at?;
        Some(
            self.finished_at
                .map(|finished| finished.duration_since(started))
                .unwrap_or_else(|| started.elapsed()),
        )
    }

    /// Idle to Running. On rejection the run stays Idle.
    pub fn start(&mut self, readiness: &Readiness) -> Result<(), PipelineError> {
        if self.state != RunState::Idle {
            return Err(PipelineError::PreconditionFailed(
                Precondition::RunAlreadyStarted,
            ));
        }
        let Some(image) = self.image.as_ref() else {
            return Err(PipelineError::PreconditionFailed(Precondition::MissingImage));
        };
        image
            .validate()
            .map_err(|reason| PipelineError::PreconditionFailed(Precondition::InvalidImage(reason)))?;
        if !readiness.is_ready() {
            return Err(PipelineError::PreconditionFailed(
                Precondition::SessionNotReady(readiness.clone()),
            ));
        }
        self.state = RunState::Running;
        self.started_at = Some(Instant::now());
        Ok(())
    }

    /// Running to a terminal state. Ignored from any other state.
    pub fn finish(&mut self, outcome: &Result<CaptionResult, PipelineError>) -> bool {
        if self.state != RunState::Running {
            return false;
        }
        self.state = match outcome {
            Ok(result) => RunState::Succeeded(result.clone()),
            Err(err) => RunState::Failed(err.clone()),
        };
        self.finished_at = Some(Instant::now());
        true
    }

    pub fn outcome(&self) -> Option<Result<&CaptionResult, &PipelineError>> {
        match &self.state {
            RunState::Succeeded(result) => Some(Ok(result)),
            RunState::Failed(err) => Some(Err(err)),
            RunState::Idle | RunState::Running => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use captionify_contracts::caption::{CaptionResult, ImagePayload, ImageRejection, RawDescription};

    use super::{PipelineRun, RunState};
    use crate::error::{PipelineError, Precondition};
    use crate::session::Readiness;

    fn png() -> ImagePayload {
        ImagePayload::new(vec![1, 2, 3], "image/png")
    }

    fn caption() -> CaptionResult {
        CaptionResult {
            text: "Sun and sand 🌞 #a #b #c".to_string(),
            description: RawDescription::new("a beach").unwrap(),
        }
    }

    #[test]
    fn missing_image_is_rejected_and_run_stays_idle() {
        let mut run = PipelineRun::new(None, Some("fun"));
        assert_eq!(
            run.start(&Readiness::Ready),
            Err(PipelineError::PreconditionFailed(Precondition::MissingImage))
        );
        assert_eq!(run.state(), &RunState::Idle);
        assert!(run.elapsed().is_none());
    }

    #[test]
    fn non_image_mime_is_rejected() {
        let mut run = PipelineRun::new(
            Some(ImagePayload::new(b"%PDF".to_vec(), "application/pdf")),
            None,
        );
        assert_eq!(
            run.start(&Readiness::Ready),
            Err(PipelineError::PreconditionFailed(Precondition::InvalidImage(
                ImageRejection::NotAnImage {
                    mime_type: "application/pdf".to_string()
                }
            )))
        );
        assert_eq!(run.state(), &RunState::Idle);
    }

    #[test]
    fn session_must_be_ready() {
        let mut run = PipelineRun::new(Some(png()), None);
        let failed = Readiness::Failed("bad token".to_string());
        assert_eq!(
            run.start(&failed),
            Err(PipelineError::PreconditionFailed(
                Precondition::SessionNotReady(failed.clone())
            ))
        );
        assert_eq!(run.state(), &RunState::Idle);
        assert!(run.start(&Readiness::Ready).is_ok());
        assert_eq!(run.state(), &RunState::Running);
    }

    #[test]
    fn terminal_states_are_final() {
        let mut run = PipelineRun::new(Some(png()), Some("witty"));
        assert_eq!(run.tone().as_str(), "witty");
        assert!(!run.finish(&Ok(caption())));

        run.start(&Readiness::Ready).unwrap();
        assert!(run.finish(&Ok(caption())));
        assert_eq!(run.state().as_str(), "succeeded");
        assert!(run.state().is_terminal());

        assert!(!run.finish(&Err(PipelineError::EmptyCaption)));
        assert_eq!(run.outcome(), Some(Ok(&caption())));
        assert_eq!(
            run.start(&Readiness::Ready),
            Err(PipelineError::PreconditionFailed(
                Precondition::RunAlreadyStarted
            ))
        );
        assert!(run.elapsed().is_some());
    }

    #[test]
    fn failure_is_recorded() {
        let mut run = PipelineRun::new(Some(png()), None);
        run.start(&Readiness::Ready).unwrap();
        run.finish(&Err(PipelineError::EmptyDescription));
        assert_eq!(run.state(), &RunState::Failed(PipelineError::EmptyDescription));
        assert_eq!(run.outcome(), Some(Err(&PipelineError::EmptyDescription)));
        assert_ne!(PipelineRun::new(None, None).id(), run.id());
    }
}
