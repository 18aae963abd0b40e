use std::env;
use std::fmt;
use std::time::Duration;

use captionify_contracts::models::{Fallback, ModelSelector, CAPABILITY_CAPTION, CAPABILITY_TEXT};
use tracing::warn;

use crate::backends::{
    GenerationParams, DEFAULT_API_BASE, DEFAULT_DESCRIPTION_MAX_LENGTH,
    DEFAULT_DESCRIPTION_MIN_LENGTH,
};
use crate::invoker::{
    RetryPolicy, DEFAULT_ATTEMPT_TIMEOUT_MS, DEFAULT_MAX_RETRIES, DEFAULT_TRANSIENT_BACKOFF_MS,
    DEFAULT_UNAVAILABLE_BACKOFF_MS,
};
use crate::pipeline::DEFAULT_MAX_CAPTION_CHARS;

pub const API_KEY_ENV_KEYS: [&str; 4] = [
    "HUGGING_FACE_API_KEY",
    "HF_TOKEN",
    "HUGGINGFACEHUB_API_TOKEN",
    "VITE_HUGGING_FACE_API_KEY",
];

const FALLBACK_CAPTION_MODEL: &str = "Salesforce/blip-image-captioning-base";
const FALLBACK_TEXT_MODEL: &str = "mistralai/Mistral-7B-Instruct-v0.2";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptionBackend {
    InferenceApi,
    GradioSpace { url: String },
}

#[derive(Clone)]
pub struct EngineConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub caption_model: String,
    pub text_model: String,
    pub caption_backend: CaptionBackend,
    pub retry: RetryPolicy,
    pub max_caption_chars: usize,
    pub language: Option<String>,
    pub description_min_length: u32,
    pub description_max_length: u32,
    pub generation: GenerationParams,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup. Blank values count as
    /// unset; numbers out of range are clamped.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| first_non_empty(&lookup, &[key]);
        let number = |key: &str, default: u64, min: u64, max: u64| {
            value_as_u64(value(key).as_deref(), default, min, max)
        };

        let retry = RetryPolicy {
            max_retries: number("CAPTIONIFY_MAX_RETRIES", DEFAULT_MAX_RETRIES.into(), 0, 10) as u32,
            attempt_timeout: Duration::from_millis(number(
                "CAPTIONIFY_TIMEOUT_MS",
                DEFAULT_ATTEMPT_TIMEOUT_MS,
                1_000,
                300_000,
            )),
            transient_backoff: Duration::from_millis(number(
                "CAPTIONIFY_RETRY_BACKOFF_MS",
                DEFAULT_TRANSIENT_BACKOFF_MS,
                0,
                60_000,
            )),
            unavailable_backoff: Duration::from_millis(number(
                "CAPTIONIFY_UNAVAILABLE_BACKOFF_MS",
                DEFAULT_UNAVAILABLE_BACKOFF_MS,
                0,
                120_000,
            )),
            ..RetryPolicy::default()
        };

        let description_min_length = number(
            "CAPTIONIFY_DESCRIPTION_MIN_LENGTH",
            DEFAULT_DESCRIPTION_MIN_LENGTH.into(),
            1,
            200,
        ) as u32;
        let description_max_length = number(
            "CAPTIONIFY_DESCRIPTION_MAX_LENGTH",
            DEFAULT_DESCRIPTION_MAX_LENGTH.into(),
            1,
            500,
        )
        .max(description_min_length.into()) as u32;

        let generation = GenerationParams {
            max_new_tokens: number("CAPTIONIFY_MAX_NEW_TOKENS", 100, 16, 1_024) as u32,
            temperature: value_as_f64(value("CAPTIONIFY_TEMPERATURE").as_deref(), 0.7, 0.0, 2.0),
            ..GenerationParams::default()
        };

        let mut config = Self {
            api_key: first_non_empty(&lookup, &API_KEY_ENV_KEYS),
            api_base: value("CAPTIONIFY_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            caption_model: FALLBACK_CAPTION_MODEL.to_string(),
            text_model: FALLBACK_TEXT_MODEL.to_string(),
            caption_backend: match value("CAPTIONIFY_GRADIO_URL") {
                Some(url) => CaptionBackend::GradioSpace { url },
                None => CaptionBackend::InferenceApi,
            },
            retry,
            max_caption_chars: number(
                "CAPTIONIFY_MAX_CAPTION_CHARS",
                DEFAULT_MAX_CAPTION_CHARS as u64,
                20,
                2_000,
            ) as usize,
            language: value("CAPTIONIFY_LANGUAGE"),
            description_min_length,
            description_max_length,
            generation,
        };
        config.select_models(
            value("CAPTIONIFY_CAPTION_MODEL").as_deref(),
            value("CAPTIONIFY_TEXT_MODEL").as_deref(),
        );
        config
    }

    /// Resolves model names through the registry. Unlisted names are used
    /// as given; a listed model with the wrong capability falls back to the
    /// default for that capability.
    pub fn select_models(&mut self, caption: Option<&str>, text: Option<&str>) {
        let selector = ModelSelector::default();
        self.caption_model =
            resolve_model(&selector, caption, CAPABILITY_CAPTION, FALLBACK_CAPTION_MODEL);
        self.text_model = resolve_model(&selector, text, CAPABILITY_TEXT, FALLBACK_TEXT_MODEL);
    }

    pub fn backend_name(&self) -> &'static str {
        match self.caption_backend {
            CaptionBackend::InferenceApi => "inference-api",
            CaptionBackend::GradioSpace { .. } => "gradio",
        }
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_base", &self.api_base)
            .field("caption_model", &self.caption_model)
            .field("text_model", &self.text_model)
            .field("caption_backend", &self.caption_backend)
            .field("retry", &self.retry)
            .field("max_caption_chars", &self.max_caption_chars)
            .field("language", &self.language)
            .finish_non_exhaustive()
    }
}

fn resolve_model(
    selector: &ModelSelector,
    requested: Option<&str>,
    capability: &str,
    fallback: &str,
) -> String {
    match selector.select(requested, capability, true) {
        Ok(selection) => {
            if let Some(reason @ Fallback::Unavailable { .. }) = &selection.fallback {
                warn!(
                    model = %selection.model.name,
                    "{reason}; using the default {capability} model"
                );
            }
            selection.model.name
        }
        Err(err) => {
            warn!("{err}");
            fallback.to_string()
        }
    }
}

fn first_non_empty<F>(lookup: &F, keys: &[&str]) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    keys.iter().find_map(|key| {
        lookup(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

fn value_as_u64(raw: Option<&str>, default: u64, min: u64, max: u64) -> u64 {
    raw.and_then(|text| text.trim().parse::<u64>().ok())
        .unwrap_or(default)
        .clamp(min, max)
}

fn value_as_f64(raw: Option<&str>, default: f64, min: f64, max: f64) -> f64 {
    raw.and_then(|text| text.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(default)
        .clamp(min, max)
}
