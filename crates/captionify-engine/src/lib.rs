//! Resilient two-stage caption pipeline: an image captioner followed by a
//! text generation model, both reached over unreliable hosted endpoints.
//!
//! [`CaptionEngine`] is the entry point. It owns the captioning session
//! ([`session`]), sends every remote call through the retrying
//! [`invoker::Invoker`], and runs one [`run::PipelineRun`] at a time.

pub mod backends;
pub mod config;
mod engine;
pub mod error;
pub mod invoker;
pub mod pipeline;
pub mod run;
pub mod sanitize;
pub mod session;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use config::{CaptionBackend, EngineConfig};
pub use engine::CaptionEngine;
pub use error::{ErrorKind, PipelineError, Precondition, Stage};
pub use invoker::{InvokeError, Invoker, RetryPolicy};
pub use pipeline::{build_caption_prompt, CaptionPipeline};
pub use run::{PipelineRun, RunState};
pub use session::{Readiness, SessionConnector, SessionHandle, SessionManager};
pub use transport::{HttpTransport, Transport};
