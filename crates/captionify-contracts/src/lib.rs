//! Data shared between the caption engine and its callers.

pub mod caption;
pub mod events;
pub mod models;

#[doc(hidden)]
pub use serde_json as __serde_json;
