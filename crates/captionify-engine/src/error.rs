use std::fmt;

use captionify_contracts::caption::ImageRejection;

use crate::invoker::InvokeError;
use crate::session::Readiness;

/// Which remote call a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Describe,
    Generate,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Describe => "describe",
            Self::Generate => "generate",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Describe => f.write_str("captioning service"),
            Self::Generate => f.write_str("generation service"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    MissingImage,
    InvalidImage(ImageRejection),
    SessionNotReady(Readiness),
    RunInProgress,
    RunAlreadyStarted,
}

impl fmt::Display for Precondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingImage => f.write_str("no image was supplied"),
            Self::InvalidImage(reason) => write!(f, "invalid image: {reason}"),
            Self::SessionNotReady(readiness) => {
                write!(f, "caption session is not ready ({readiness})")
            }
            Self::RunInProgress => f.write_str("another caption run is already in progress"),
            Self::RunAlreadyStarted => f.write_str("this run has already been started"),
        }
    }
}

/// Flat classification of [`PipelineError`], stable enough for events and
/// exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PreconditionFailed,
    SessionInitFailed,
    ServiceUnavailable,
    TransientNetworkFailure,
    UpstreamFatal,
    EmptyDescription,
    EmptyCaption,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreconditionFailed => "precondition_failed",
            Self::SessionInitFailed => "session_init_failed",
            Self::ServiceUnavailable => "service_unavailable",
            Self::TransientNetworkFailure => "transient_network_failure",
            Self::UpstreamFatal => "upstream_fatal",
            Self::EmptyDescription => "empty_description",
            Self::EmptyCaption => "empty_caption",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("precondition failed: {0}")]
    PreconditionFailed(Precondition),
    #[error("caption session could not be established: {0}")]
    SessionInitFailed(String),
    #[error("{stage} still unavailable after {attempts} attempt(s): {message}")]
    ServiceUnavailable {
        stage: Stage,
        attempts: u32,
        message: String,
    },
    #[error("{stage} unreachable after {attempts} attempt(s): {message}")]
    TransientNetworkFailure {
        stage: Stage,
        attempts: u32,
        message: String,
    },
    #[error("{stage} returned an unusable response{}: {message}", status_suffix(.status))]
    UpstreamFatal {
        stage: Stage,
        status: Option<u16>,
        message: String,
    },
    #[error("captioning service returned an empty description")]
    EmptyDescription,
    #[error("generation service returned an empty caption")]
    EmptyCaption,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            Self::SessionInitFailed(_) => ErrorKind::SessionInitFailed,
            Self::ServiceUnavailable { .. } => ErrorKind::ServiceUnavailable,
            Self::TransientNetworkFailure { .. } => ErrorKind::TransientNetworkFailure,
            Self::UpstreamFatal { .. } => ErrorKind::UpstreamFatal,
            Self::EmptyDescription => ErrorKind::EmptyDescription,
            Self::EmptyCaption => ErrorKind::EmptyCaption,
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::ServiceUnavailable { stage, .. }
            | Self::TransientNetworkFailure { stage, .. }
            | Self::UpstreamFatal { stage, .. } => Some(*stage),
            Self::EmptyDescription => Some(Stage::Describe),
            Self::EmptyCaption => Some(Stage::Generate),
            Self::PreconditionFailed(_) | Self::SessionInitFailed(_) => None,
        }
    }

    pub(crate) fn from_invoke(stage: Stage, err: InvokeError) -> Self {
        match err {
            InvokeError::ServiceUnavailable {
                attempts, message, ..
            } => Self::ServiceUnavailable {
                stage,
                attempts,
                message,
            },
            InvokeError::Transient { attempts, message } => Self::TransientNetworkFailure {
                stage,
                attempts,
                message,
            },
            InvokeError::Fatal {
                status, message, ..
            } => Self::UpstreamFatal {
                stage,
                status,
                message,
            },
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|code| format!(" ({code})")).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::{ErrorKind, PipelineError, Precondition, Stage};
    use crate::invoker::InvokeError;
    use crate::session::Readiness;

    #[test]
    fn invoke_errors_map_to_stage_tagged_kinds() {
        let unavailable = PipelineError::from_invoke(
            Stage::Describe,
            InvokeError::ServiceUnavailable {
                attempts: 4,
                status: 503,
                message: "Model is currently loading".to_string(),
            },
        );
        assert_eq!(unavailable.kind(), ErrorKind::ServiceUnavailable);
        assert_eq!(unavailable.stage(), Some(Stage::Describe));
        assert_eq!(
            unavailable.to_string(),
            "captioning service still unavailable after 4 attempt(s): Model is currently loading"
        );

        let fatal = PipelineError::from_invoke(
            Stage::Generate,
            InvokeError::Fatal {
                attempts: 1,
                status: Some(401),
                message: "Invalid credentials".to_string(),
            },
        );
        assert_eq!(fatal.kind(), ErrorKind::UpstreamFatal);
        assert_eq!(
            fatal.to_string(),
            "generation service returned an unusable response (401): Invalid credentials"
        );

        let transient = PipelineError::from_invoke(
            Stage::Generate,
            InvokeError::Transient {
                attempts: 4,
                message: "no response within 30000 ms".to_string(),
            },
        );
        assert_eq!(transient.kind(), ErrorKind::TransientNetworkFailure);
    }

    #[test]
    fn precondition_messages_name_the_missing_piece() {
        let err = PipelineError::PreconditionFailed(Precondition::SessionNotReady(
            Readiness::Uninitialized,
        ));
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
        assert_eq!(err.stage(), None);
        assert_eq!(
            err.to_string(),
            "precondition failed: caption session is not ready (uninitialized)"
        );
        assert_eq!(ErrorKind::EmptyCaption.as_str(), "empty_caption");
    }
}
