use captionify_contracts::caption::{CaptionResult, ImagePayload, RawDescription, Tone};
use tracing::{debug, warn};

use crate::backends::{extract_generated_text, TextGenerationBackend};
use crate::error::{PipelineError, Stage};
use crate::invoker::{Invoker, RetryPolicy};
use crate::sanitize::{clean_description, finalize_caption};
use crate::session::SessionHandle;

pub const DEFAULT_MAX_CAPTION_CHARS: usize = 150;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub describe_policy: RetryPolicy,
    pub generate_policy: RetryPolicy,
    pub max_caption_chars: usize,
    pub language: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            describe_policy: RetryPolicy::default(),
            generate_policy: RetryPolicy::default(),
            max_caption_chars: DEFAULT_MAX_CAPTION_CHARS,
            language: None,
        }
    }
}

/// Instruction prompt for stage 2. The description and tone are embedded
/// verbatim.
pub fn build_caption_prompt(
    description: &RawDescription,
    tone: &Tone,
    max_chars: usize,
    language: Option<&str>,
) -> String {
    let mut prompt = format!(
        "USER: Generate a social media caption for: \"{description}\".\n\
         Tone: {tone}.\n\
         Format: Catchy start, 2-3 relevant emojis, 3 hashtags at end.\n\
         Strict rules: No explanations about caption, only 1 caption under {max_chars} chars. \
         And caption should not contain '\u{FFFD}'.\n"
    );
    if let Some(language) = language.map(str::trim).filter(|value| !value.is_empty()) {
        prompt.push_str(&format!("Language: write the caption in {language}.\n"));
    }
    prompt.push_str("ASSISTANT:");
    prompt
}

/// Describe, then generate. Stage 2 starts only after stage 1 produced a
/// non-empty description.
#[derive(Debug)]
pub struct CaptionPipeline {
    invoker: Invoker,
    generator: TextGenerationBackend,
    config: PipelineConfig,
}

impl CaptionPipeline {
    pub fn new(invoker: Invoker, generator: TextGenerationBackend, config: PipelineConfig) -> Self {
        Self {
            invoker,
            generator,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn generator(&self) -> &TextGenerationBackend {
        &self.generator
    }

    pub fn prompt_for(&self, description: &RawDescription, tone: &Tone) -> String {
        build_caption_prompt(
            description,
            tone,
            self.config.max_caption_chars,
            self.config.language.as_deref(),
        )
    }

    pub async fn synthesize(
        &self,
        handle: &dyn SessionHandle,
        image: &ImagePayload,
        tone: &Tone,
    ) -> Result<CaptionResult, PipelineError> {
        let description = self.describe(handle, image).await?;
        let text = self.generate(&description, tone).await?;
        Ok(CaptionResult { text, description })
    }

    pub async fn describe(
        &self,
        handle: &dyn SessionHandle,
        image: &ImagePayload,
    ) -> Result<RawDescription, PipelineError> {
        let raw = handle
            .describe(&self.invoker, image, &self.config.describe_policy)
            .await
            .map_err(|err| PipelineError::from_invoke(Stage::Describe, err))?;
        let cleaned = clean_description(&raw);
        debug!(raw = %raw, cleaned = %cleaned, "stage 1 description");
        RawDescription::new(&cleaned).ok_or(PipelineError::EmptyDescription)
    }

    pub async fn generate(
        &self,
        description: &RawDescription,
        tone: &Tone,
    ) -> Result<String, PipelineError> {
        let prompt = self.prompt_for(description, tone);
        let request = self.generator.request(&prompt);
        let value = self
            .invoker
            .invoke(&request, &self.config.generate_policy)
            .await
            .map_err(|err| PipelineError::from_invoke(Stage::Generate, err))?;

        let raw = extract_generated_text(&value).unwrap_or_default();
        // Some deployments ignore return_full_text and echo the prompt.
        let raw = raw.trim_start();
        let raw = raw.strip_prefix(prompt.as_str()).unwrap_or(raw);
        let caption = finalize_caption(raw);
        if caption.is_empty() {
            return Err(PipelineError::EmptyCaption);
        }

        let char_count = caption.chars().count();
        if char_count > self.config.max_caption_chars {
            warn!(
                char_count,
                max_chars = self.config.max_caption_chars,
                "caption longer than requested"
            );
        }
        Ok(caption)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use captionify_contracts::caption::{ImagePayload, RawDescription, Tone};
    use serde_json::json;

    use super::{build_caption_prompt, CaptionPipeline, PipelineConfig};
    use crate::backends::{GenerationParams, InferenceApiConnector, TextGenerationBackend};
    use crate::error::{PipelineError, Stage};
    use crate::invoker::{Invoker, RetryPolicy};
    use crate::session::{SessionConnector, SessionHandle};
    use crate::test_support::{Scripted, ScriptedTransport};
    use crate::transport::RequestBody;

    async fn fixture(
        script: Vec<Scripted>,
    ) -> (Arc<ScriptedTransport>, CaptionPipeline, Arc<dyn SessionHandle>) {
        let transport = ScriptedTransport::new(script);
        let invoker = Invoker::new(transport.clone());
        let handle = InferenceApiConnector::new(
            "http://inference.test",
            "acme/blip",
            Some("hf_test".to_string()),
        )
        .connect(&invoker, &RetryPolicy::default())
        .await
        .unwrap();
        let generator = TextGenerationBackend::new(
            "http://inference.test",
            "acme/writer",
            Some("hf_test".to_string()),
            GenerationParams::default(),
        )
        .unwrap();
        let pipeline = CaptionPipeline::new(invoker, generator, PipelineConfig::default());
        (transport, pipeline, handle)
    }

    fn image() -> ImagePayload {
        ImagePayload::new(vec![0x89, b'P', b'N', b'G'], "image/png")
    }

    #[test]
    fn prompt_embeds_description_tone_and_limit() {
        let description = RawDescription::new("a dog running on a beach").unwrap();
        let prompt = build_caption_prompt(&description, &Tone::new(Some("fun")), 150, None);
        assert!(prompt.starts_with("USER: Generate a social media caption for: \"a dog running on a beach\"."));
        assert!(prompt.contains("Tone: fun."));
        assert!(prompt.contains("2-3 relevant emojis, 3 hashtags at end"));
        assert!(prompt.contains("only 1 caption under 150 chars"));
        assert!(prompt.ends_with("ASSISTANT:"));
        assert!(!prompt.contains("Language:"));

        let localized =
            build_caption_prompt(&description, &Tone::default(), 80, Some(" Spanish "));
        assert!(localized.contains("Language: write the caption in Spanish."));
        assert!(localized.contains("under 80 chars"));
    }

    #[test]
    fn prompt_passes_unknown_tone_through() {
        let description = RawDescription::new("a cat").unwrap();
        let prompt =
            build_caption_prompt(&description, &Tone::new(Some("film-noir detective")), 150, None);
        assert!(prompt.contains("Tone: film-noir detective."));
    }

    #[tokio::test(start_paused = true)]
    async fn dog_on_beach_yields_caption_without_preamble() {
        let (transport, pipeline, handle) = fixture(vec![
            Scripted::json(200, json!([{"generated_text": "a dog running on a beach"}])),
            Scripted::json(
                200,
                json!([{
                    "generated_text": "Caption Ideas: Beach days are the best! 🐶🌊 #dogsofinstagram #beachlife #funtimes"
                }]),
            ),
        ])
        .await;

        let result = pipeline
            .synthesize(handle.as_ref(), &image(), &Tone::new(Some("fun")))
            .await
            .unwrap();

        assert_eq!(
            result.text,
            "Beach days are the best! 🐶🌊 #dogsofinstagram #beachlife #funtimes"
        );
        assert_eq!(result.description.as_str(), "a dog running on a beach");
        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        match &calls[1].body {
            RequestBody::Json(body) => {
                let inputs = body["inputs"].as_str().unwrap_or_default();
                assert!(inputs.contains("\"a dog running on a beach\""));
                assert!(inputs.contains("Tone: fun."));
                assert_eq!(body["parameters"]["temperature"], 0.7);
            }
            other => panic!("expected JSON body, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_description_never_reaches_stage_two() {
        let (transport, pipeline, handle) = fixture(vec![Scripted::json(
            200,
            json!([{"generated_text": "   "}]),
        )])
        .await;

        let err = pipeline
            .synthesize(handle.as_ref(), &image(), &Tone::default())
            .await
            .unwrap_err();

        assert_eq!(err, PipelineError::EmptyDescription);
        assert_eq!(transport.calls_labelled("generate"), 0);
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_generated_text_field_counts_as_empty() {
        let (_transport, pipeline, handle) =
            fixture(vec![Scripted::json(200, json!({"unexpected": true}))]).await;

        let err = pipeline
            .synthesize(handle.as_ref(), &image(), &Tone::default())
            .await
            .unwrap_err();

        assert_eq!(err, PipelineError::EmptyDescription);
    }

    #[tokio::test(start_paused = true)]
    async fn stage_two_timeouts_surface_as_transient_network_failure() {
        let mut script = vec![Scripted::json(
            200,
            json!([{"generated_text": "a dog running on a beach"}]),
        )];
        script.extend(std::iter::repeat(Scripted::Hang).take(4));
        let (transport, pipeline, handle) = fixture(script).await;

        let err = pipeline
            .synthesize(handle.as_ref(), &image(), &Tone::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::TransientNetworkFailure {
                stage: Stage::Generate,
                attempts: 4,
                ..
            }
        ));
        assert_eq!(transport.calls_labelled("describe"), 1);
        assert_eq!(transport.calls_labelled("generate"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn stage_one_unavailable_is_tagged_with_describe_stage() {
        let (transport, pipeline, handle) = fixture(vec![
            Scripted::status(503, r#"{"error":"Model acme/blip is currently loading"}"#);
            4
        ])
        .await;

        let err = pipeline
            .synthesize(handle.as_ref(), &image(), &Tone::default())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            PipelineError::ServiceUnavailable {
                stage: Stage::Describe,
                attempts: 4,
                message: "Model acme/blip is currently loading".to_string(),
            }
        );
        assert_eq!(transport.calls_labelled("generate"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn garbage_only_generation_is_empty_caption() {
        let (_transport, pipeline, handle) = fixture(vec![
            Scripted::json(200, json!([{"generated_text": "a dog"}])),
            Scripted::json(200, json!([{"generated_text": "\u{FFFD}\u{0002} ï¿½ "}])),
        ])
        .await;

        let err = pipeline
            .synthesize(handle.as_ref(), &image(), &Tone::default())
            .await
            .unwrap_err();

        assert_eq!(err, PipelineError::EmptyCaption);
    }

    #[tokio::test(start_paused = true)]
    async fn echoed_prompt_is_removed_and_long_caption_kept_whole() {
        let description = RawDescription::new("a dog").unwrap();
        let (_, probe, _) = fixture(Vec::new()).await;
        let prompt = probe.prompt_for(&description, &Tone::default());
        let long_caption = format!("{} 🐶 #a #b #c", "Sunny ".repeat(40).trim_end());
        let (_transport, pipeline, handle) = fixture(vec![
            Scripted::json(200, json!([{"generated_text": "a dog"}])),
            Scripted::json(
                200,
                json!([{ "generated_text": format!("{prompt} {long_caption}") }]),
            ),
        ])
        .await;

        let result = pipeline
            .synthesize(handle.as_ref(), &image(), &Tone::default())
            .await
            .unwrap();

        assert_eq!(result.text, long_caption);
        assert!(result.exceeds(150));
    }
}
