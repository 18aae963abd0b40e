use indexmap::IndexMap;

pub const CAPABILITY_CAPTION: &str = "caption";
pub const CAPABILITY_TEXT: &str = "text";

const HOSTED_PROVIDER: &str = "huggingface";

// First entry per capability is that capability's default.
const BUILTIN_MODELS: &[(&str, &str, Option<u64>)] = &[
    ("Salesforce/blip-image-captioning-base", CAPABILITY_CAPTION, None),
    ("Salesforce/blip-image-captioning-large", CAPABILITY_CAPTION, None),
    ("nlpconnect/vit-gpt2-image-captioning", CAPABILITY_CAPTION, None),
    ("mistralai/Mistral-7B-Instruct-v0.2", CAPABILITY_TEXT, Some(32_768)),
    ("mistralai/Mistral-7B-Instruct-v0.3", CAPABILITY_TEXT, Some(32_768)),
    ("HuggingFaceH4/zephyr-7b-beta", CAPABILITY_TEXT, Some(32_768)),
    ("tiiuae/falcon-7b-instruct", CAPABILITY_TEXT, Some(2_048)),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    /// Repository id on the hosting service, e.g. `Salesforce/blip-image-captioning-base`.
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
    /// Upper bound on prompt + generated tokens, for text models.
    pub context_window: Option<u64>,
}

impl ModelSpec {
    /// A hosted model serving a single capability.
    pub fn hosted(name: impl Into<String>, capability: &str) -> Self {
        Self {
            name: name.into(),
            provider: HOSTED_PROVIDER.to_string(),
            capabilities: vec![capability.to_string()],
            context_window: None,
        }
    }

    pub fn with_context_window(mut self, tokens: u64) -> Self {
        self.context_window = Some(tokens);
        self
    }

    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

/// Known models keyed by name, in registration order.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::from_specs(BUILTIN_MODELS.iter().map(|(name, capability, window)| {
            let spec = ModelSpec::hosted(*name, capability);
            match window {
                Some(tokens) => spec.with_context_window(*tokens),
                None => spec,
            }
        }))
    }
}

impl ModelRegistry {
    pub fn from_specs(specs: impl IntoIterator<Item = ModelSpec>) -> Self {
        Self {
            models: specs
                .into_iter()
                .map(|spec| (spec.name.clone(), spec))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    pub fn supporting<'a>(&'a self, capability: &'a str) -> impl Iterator<Item = &'a ModelSpec> {
        self.models
            .values()
            .filter(move |model| model.supports(capability))
    }

    pub fn default_for(&self, capability: &str) -> Option<&ModelSpec> {
        self.models.values().find(|model| model.supports(capability))
    }

    /// The named model, only when it serves `capability`.
    pub fn lookup(&self, name: &str, capability: &str) -> Option<&ModelSpec> {
        self.get(name).filter(|model| model.supports(capability))
    }
}
