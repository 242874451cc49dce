//! Already-validated generation requests handed to the provider.
//!
//! Callers (forms, CLIs) do their own validation; these types only carry the
//! output-shape parameters a provider understands.

use bon::Builder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A binary image attached to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineImage {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl InlineImage {
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data,
        }
    }
}

/// Output aspect ratio accepted by the image and video models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AspectRatio {
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "16:9")]
    Landscape,
    #[serde(rename = "9:16")]
    Portrait,
    #[serde(rename = "4:3")]
    Standard,
    #[serde(rename = "3:4")]
    StandardPortrait,
}

impl AspectRatio {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Square => "1:1",
            Self::Landscape => "16:9",
            Self::Portrait => "9:16",
            Self::Standard => "4:3",
            Self::StandardPortrait => "3:4",
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AspectRatio {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1:1" => Ok(Self::Square),
            "16:9" => Ok(Self::Landscape),
            "9:16" => Ok(Self::Portrait),
            "4:3" => Ok(Self::Standard),
            "3:4" => Ok(Self::StandardPortrait),
            other => Err(format!("unsupported aspect ratio: {other}")),
        }
    }
}

/// Resolution tier for the high-resolution image model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolutionTier {
    #[default]
    #[serde(rename = "1K")]
    OneK,
    #[serde(rename = "2K")]
    TwoK,
    #[serde(rename = "4K")]
    FourK,
}

impl ResolutionTier {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OneK => "1K",
            Self::TwoK => "2K",
            Self::FourK => "4K",
        }
    }
}

impl fmt::Display for ResolutionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "1K" => Ok(Self::OneK),
            "2K" => Ok(Self::TwoK),
            "4K" => Ok(Self::FourK),
            other => Err(format!("unsupported resolution tier: {other}")),
        }
    }
}

/// Standard or high-resolution image edit/generate request.
#[derive(Debug, Clone, Builder)]
pub struct ImageRequest {
    #[builder(into)]
    pub prompt: String,
    /// The image being edited, if any.
    pub source: Option<InlineImage>,
    /// Style or material references sent after the source image.
    #[builder(default)]
    pub references: Vec<InlineImage>,
    pub aspect_ratio: Option<AspectRatio>,
    /// Only honoured by the high-resolution operation.
    #[builder(default)]
    pub resolution: ResolutionTier,
    /// Number of images to produce.
    #[builder(default = 1)]
    pub count: u32,
}

/// Video generation request.
#[derive(Debug, Clone, Builder)]
pub struct VideoRequest {
    #[builder(into)]
    pub prompt: String,
    pub source: Option<InlineImage>,
    pub aspect_ratio: Option<AspectRatio>,
}

/// Text generation request (prompt enhancement, analysis, descriptions).
#[derive(Debug, Clone, Builder)]
pub struct TextRequest {
    #[builder(into)]
    pub prompt: String,
    #[builder(into)]
    pub system: Option<String>,
    #[builder(default)]
    pub images: Vec<InlineImage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aspect_ratio_parse() {
        assert_eq!("16:9".parse::<AspectRatio>().unwrap(), AspectRatio::Landscape);
        assert!("2:1".parse::<AspectRatio>().is_err());
    }

    #[test]
    fn test_aspect_ratio_serde_uses_ratio_string() {
        let json = serde_json::to_string(&AspectRatio::Portrait).unwrap();
        assert_eq!(json, "\"9:16\"");
    }

    #[test]
    fn test_resolution_parse_case_insensitive() {
        assert_eq!("4k".parse::<ResolutionTier>().unwrap(), ResolutionTier::FourK);
        assert_eq!(ResolutionTier::default().as_str(), "1K");
    }

    #[test]
    fn test_image_request_builder_defaults() {
        let req = ImageRequest::builder().prompt("modern villa").build();
        assert_eq!(req.count, 1);
        assert!(req.references.is_empty());
        assert!(req.source.is_none());
        assert_eq!(req.resolution, ResolutionTier::OneK);
    }

    #[test]
    fn test_text_request_builder() {
        let req = TextRequest::builder()
            .prompt("describe")
            .system("you are an architect")
            .build();
        assert_eq!(req.system.as_deref(), Some("you are an architect"));
    }
}
