use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use captionify_contracts::caption::ImagePayload;
use reqwest::Url;
use serde::Serialize;
use serde_json::{json, Value};

use crate::invoker::{InvokeError, Invoker, RetryPolicy};
use crate::session::{SessionConnector, SessionHandle};
use crate::transport::InvokeRequest;

pub const DEFAULT_API_BASE: &str = "https://api-inference.huggingface.co";
pub const DEFAULT_DESCRIPTION_MIN_LENGTH: u32 = 5;
pub const DEFAULT_DESCRIPTION_MAX_LENGTH: u32 = 60;

/// `{base}/models/{model}` with exactly one slash at the join.
pub fn model_endpoint(api_base: &str, model: &str) -> Result<String> {
    let base = format!("{}/", api_base.trim().trim_end_matches('/'));
    let base = Url::parse(&base).with_context(|| format!("invalid API base URL '{api_base}'"))?;
    let model = model.trim().trim_matches('/');
    if model.is_empty() {
        bail!("model name is empty");
    }
    let url = base
        .join(&format!("models/{model}"))
        .with_context(|| format!("invalid model name '{model}'"))?;
    Ok(url.to_string())
}

fn space_endpoint(space_url: &str, path: &str) -> Result<String> {
    let base = format!("{}/", space_url.trim().trim_end_matches('/'));
    let base = Url::parse(&base).with_context(|| format!("invalid Gradio URL '{space_url}'"))?;
    Ok(base.join(path)?.to_string())
}

/// Text from the common inference response shapes:
/// `[{"generated_text": ..}]`, `{"generated_text": ..}` or a bare string.
pub fn extract_generated_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Array(items) => items.iter().find_map(extract_generated_text),
        Value::Object(map) => map
            .get("generated_text")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

/// First string in a Gradio `{"data": [...]}` response. Trailing entries
/// (timings, confidence) are ignored.
pub fn extract_gradio_text(value: &Value) -> Option<String> {
    value
        .get("data")
        .and_then(Value::as_array)
        .and_then(|items| items.iter().find_map(Value::as_str))
        .map(str::to_string)
}

fn redact(token: &Option<String>) -> Option<&'static str> {
    token.as_ref().map(|_| "<redacted>")
}

/// Hosted inference API captioner. Connecting only validates configuration.
pub struct InferenceApiConnector {
    api_base: String,
    model: String,
    api_key: Option<String>,
}

impl InferenceApiConnector {
    pub fn new(api_base: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            api_base: api_base.into(),
            model: model.into(),
            api_key,
        }
    }
}

#[async_trait]
impl SessionConnector for InferenceApiConnector {
    fn backend(&self) -> &str {
        "inference-api"
    }

    async fn connect(
        &self,
        _invoker: &Invoker,
        _policy: &RetryPolicy,
    ) -> Result<Arc<dyn SessionHandle>> {
        let Some(api_key) = self
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        else {
            bail!("Missing HUGGING_FACE_API_KEY (or HF_TOKEN).");
        };
        let endpoint = model_endpoint(&self.api_base, &self.model)?;
        Ok(Arc::new(InferenceApiSession {
            model: self.model.trim().to_string(),
            endpoint,
            api_key: api_key.to_string(),
        }))
    }
}

pub struct InferenceApiSession {
    model: String,
    endpoint: String,
    api_key: String,
}

impl InferenceApiSession {
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl fmt::Debug for InferenceApiSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceApiSession")
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SessionHandle for InferenceApiSession {
    fn backend(&self) -> &str {
        "inference-api"
    }

    fn is_ready(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn describe(
        &self,
        invoker: &Invoker,
        image: &ImagePayload,
        policy: &RetryPolicy,
    ) -> Result<String, InvokeError> {
        let request = InvokeRequest::post_bytes(
            "describe",
            self.endpoint.as_str(),
            image.mime_type(),
            image.bytes().to_vec(),
        )
        .with_bearer(Some(&self.api_key));
        let value = invoker.invoke(&request, policy).await?;
        Ok(extract_generated_text(&value).unwrap_or_default())
    }
}

/// Hosted Gradio app running a captioner. Connecting fetches the app config.
pub struct GradioSpaceConnector {
    space_url: String,
    api_key: Option<String>,
    min_length: u32,
    max_length: u32,
}

impl GradioSpaceConnector {
    pub fn new(space_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            space_url: space_url.into(),
            api_key,
            min_length: DEFAULT_DESCRIPTION_MIN_LENGTH,
            max_length: DEFAULT_DESCRIPTION_MAX_LENGTH,
        }
    }

    pub fn with_lengths(mut self, min_length: u32, max_length: u32) -> Self {
        self.min_length = min_length;
        self.max_length = max_length.max(min_length);
        self
    }
}

#[async_trait]
impl SessionConnector for GradioSpaceConnector {
    fn backend(&self) -> &str {
        "gradio"
    }

    async fn connect(
        &self,
        invoker: &Invoker,
        policy: &RetryPolicy,
    ) -> Result<Arc<dyn SessionHandle>> {
        let config_url = space_endpoint(&self.space_url, "config")?;
        let predict_url = space_endpoint(&self.space_url, "run/predict")?;
        let request =
            InvokeRequest::get("session_config", config_url.as_str()).with_bearer(self.api_key.as_deref());
        let config = invoker
            .invoke(&request, policy)
            .await
            .with_context(|| format!("failed to reach Gradio app at {}", self.space_url.trim()))?;
        if !config.is_object() {
            bail!("Gradio app at {config_url} returned a non-object config");
        }
        let version = config
            .get("version")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(Arc::new(GradioSpaceSession {
            predict_url,
            api_key: self.api_key.clone(),
            min_length: self.min_length,
            max_length: self.max_length,
            version,
        }))
    }
}

pub struct GradioSpaceSession {
    predict_url: String,
    api_key: Option<String>,
    min_length: u32,
    max_length: u32,
    version: Option<String>,
}

impl GradioSpaceSession {
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }
}

impl fmt::Debug for GradioSpaceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GradioSpaceSession")
            .field("predict_url", &self.predict_url)
            .field("api_key", &redact(&self.api_key))
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SessionHandle for GradioSpaceSession {
    fn backend(&self) -> &str {
        "gradio"
    }

    fn is_ready(&self) -> bool {
        !self.predict_url.is_empty()
    }

    async fn describe(
        &self,
        invoker: &Invoker,
        image: &ImagePayload,
        policy: &RetryPolicy,
    ) -> Result<String, InvokeError> {
        let data_url = format!(
            "data:{};base64,{}",
            image.mime_type(),
            BASE64.encode(image.bytes())
        );
        let request = InvokeRequest::post_json(
            "describe",
            self.predict_url.as_str(),
            json!({ "data": [data_url, self.min_length, self.max_length] }),
        )
        .with_bearer(self.api_key.as_deref());
        let value = invoker.invoke(&request, policy).await?;
        Ok(extract_gradio_text(&value).unwrap_or_default())
    }
}

/// Sampling parameters sent with every stage-2 request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationParams {
    pub max_new_tokens: u32,
    pub temperature: f64,
    pub repetition_penalty: f64,
    pub top_p: f64,
    pub top_k: u32,
    pub do_sample: bool,
    /// Token ids the model must not emit (the tokenizer's chat-markup pieces).
    pub bad_words_ids: Vec<Vec<u32>>,
    pub return_full_text: bool,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 100,
            temperature: 0.7,
            repetition_penalty: 1.5,
            top_p: 0.95,
            top_k: 50,
            do_sample: true,
            bad_words_ids: vec![vec![27, 91, 437, 1659, 3359]],
            return_full_text: false,
        }
    }
}

/// Stage-2 text generation model on the hosted inference API.
pub struct TextGenerationBackend {
    model: String,
    endpoint: String,
    api_key: Option<String>,
    params: GenerationParams,
}

impl TextGenerationBackend {
    pub fn new(
        api_base: &str,
        model: &str,
        api_key: Option<String>,
        params: GenerationParams,
    ) -> Result<Self> {
        Ok(Self {
            model: model.trim().to_string(),
            endpoint: model_endpoint(api_base, model)?,
            api_key,
            params,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    pub fn request(&self, prompt: &str) -> InvokeRequest {
        InvokeRequest::post_json(
            "generate",
            self.endpoint.as_str(),
            json!({ "inputs": prompt, "parameters": &self.params }),
        )
        .with_bearer(self.api_key.as_deref())
    }
}

impl fmt::Debug for TextGenerationBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextGenerationBackend")
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .field("api_key", &redact(&self.api_key))
            .field("params", &self.params)
            .finish()
    }
}
