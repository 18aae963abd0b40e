use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use image::ImageFormat;

pub const DEFAULT_TONE: &str = "fun";

const UNKNOWN_MIME: &str = "application/octet-stream";

/// Image bytes handed to stage 1. Never mutated once built.
#[derive(Clone, PartialEq, Eq)]
pub struct ImagePayload {
    bytes: Vec<u8>,
    mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRejection {
    Empty,
    NotAnImage { mime_type: String },
}

impl fmt::Display for ImageRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "image payload is empty"),
            Self::NotAnImage { mime_type } => {
                write!(f, "'{mime_type}' is not an image MIME type")
            }
        }
    }
}

impl ImagePayload {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into().trim().to_ascii_lowercase(),
        }
    }

    /// Reads `path` and sniffs its format from the content, falling back to
    /// the file extension. Unknown formats get a non-image MIME type so that
    /// [`ImagePayload::validate`] rejects them.
    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        let mime_type = image::guess_format(&bytes)
            .or_else(|_| ImageFormat::from_path(path))
            .map(|format| format.to_mime_type())
            .unwrap_or(UNKNOWN_MIME);
        Ok(Self::new(bytes, mime_type))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn validate(&self) -> Result<(), ImageRejection> {
        if self.bytes.is_empty() {
            return Err(ImageRejection::Empty);
        }
        if !self.mime_type.starts_with("image/") {
            return Err(ImageRejection::NotAnImage {
                mime_type: self.mime_type.clone(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for ImagePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImagePayload")
            .field("mime_type", &self.mime_type)
            .field("size", &self.bytes.len())
            .finish()
    }
}

/// Caller-chosen style label. Any non-empty string is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tone(String);

impl Tone {
    pub fn new(raw: Option<&str>) -> Self {
        let value = raw
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_TONE);
        Self(value.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Tone {
    fn default() -> Self {
        Self::new(None)
    }
}

impl fmt::Display for Tone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stage-1 output after cleaning; never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDescription(String);

impl RawDescription {
    pub fn new(text: &str) -> Option<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RawDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptionResult {
    pub text: String,
    pub description: RawDescription,
}

impl CaptionResult {
    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }

    pub fn exceeds(&self, max_chars: usize) -> bool {
        self.char_count() > max_chars
    }
}

impl fmt::Display for CaptionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}
