mod registry;
mod selectors;

pub use registry::{ModelRegistry, ModelSpec, CAPABILITY_CAPTION, CAPABILITY_TEXT};
pub use selectors::{Fallback, ModelSelection, ModelSelector};
