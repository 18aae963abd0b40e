use std::fmt;

use super::registry::{ModelRegistry, ModelSpec};

/// Why a selection did not use the requested name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fallback {
    NotRequested,
    /// The name is registered but serves a different capability, or it is
    /// unlisted and unlisted names were not allowed.
    Unavailable { requested: String, capability: String },
}

impl fmt::Display for Fallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRequested => f.write_str("no model requested"),
            Self::Unavailable {
                requested,
                capability,
            } => write!(f, "model '{requested}' cannot serve '{capability}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub fallback: Option<Fallback>,
}

#[derive(Debug, Clone, Default)]
pub struct ModelSelector {
    registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: ModelRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Resolves `requested` for `capability`, falling back to the registry
    /// default for that capability.
    ///
    /// With `allow_unlisted`, names the registry has never heard of are used
    /// verbatim; hosted endpoints serve far more models than are listed here.
    pub fn select(
        &self,
        requested: Option<&str>,
        capability: &str,
        allow_unlisted: bool,
    ) -> Result<ModelSelection, String> {
        let fallback = match requested.map(str::trim).filter(|name| !name.is_empty()) {
            None => Fallback::NotRequested,
            Some(name) => {
                if let Some(model) = self.registry.lookup(name, capability) {
                    return Ok(ModelSelection {
                        model: model.clone(),
                        fallback: None,
                    });
                }
                if allow_unlisted && !self.registry.contains(name) {
                    return Ok(ModelSelection {
                        model: ModelSpec::hosted(name, capability),
                        fallback: None,
                    });
                }
                Fallback::Unavailable {
                    requested: name.to_string(),
                    capability: capability.to_string(),
                }
            }
        };

        self.registry
            .default_for(capability)
            .map(|model| ModelSelection {
                model: model.clone(),
                fallback: Some(fallback),
            })
            .ok_or_else(|| format!("no registered model serves '{capability}'"))
    }
}
