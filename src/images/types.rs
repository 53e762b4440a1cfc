use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("Invalid {field}: {value}")]
pub struct ParseParamError {
    pub field: &'static str,
    pub value: String,
}

impl ParseParamError {
    fn new(field: &'static str, value: &str) -> Self {
        Self {
            field,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Auto,
    Avif,
    Webp,
    Jpg,
    Png,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Auto => "auto",
            ImageFormat::Avif => "avif",
            ImageFormat::Webp => "webp",
            ImageFormat::Jpg => "jpg",
            ImageFormat::Png => "png",
        }
    }

    /// File extension used by the optimization cache. `Auto` has no
    /// concrete encoding and therefore no extension.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            ImageFormat::Auto => None,
            other => Some(other.as_str()),
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ImageFormat::Avif => "image/avif",
            ImageFormat::Webp => "image/webp",
            ImageFormat::Png => "image/png",
            ImageFormat::Jpg | ImageFormat::Auto => "image/jpeg",
        }
    }

    pub fn from_content_type(content_type: &str) -> Option<Self> {
        match content_type.split(';').next().map(str::trim) {
            Some("image/avif") => Some(ImageFormat::Avif),
            Some("image/webp") => Some(ImageFormat::Webp),
            Some("image/jpeg") | Some("image/jpg") => Some(ImageFormat::Jpg),
            Some("image/png") => Some(ImageFormat::Png),
            _ => None,
        }
    }

    /// Concrete formats, in cache lookup order.
    pub const CONCRETE: [ImageFormat; 4] = [
        ImageFormat::Avif,
        ImageFormat::Webp,
        ImageFormat::Jpg,
        ImageFormat::Png,
    ];
}

impl FromStr for ImageFormat {
    type Err = ParseParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(ImageFormat::Auto),
            "avif" => Ok(ImageFormat::Avif),
            "webp" => Ok(ImageFormat::Webp),
            "jpg" | "jpeg" => Ok(ImageFormat::Jpg),
            "png" => Ok(ImageFormat::Png),
            _ => Err(ParseParamError::new("format", s)),
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CropPolicy {
    MaintainRatio,
    Force,
    AtLeast,
    AtMax,
}

impl CropPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CropPolicy::MaintainRatio => "maintain_ratio",
            CropPolicy::Force => "force",
            CropPolicy::AtLeast => "at_least",
            CropPolicy::AtMax => "at_max",
        }
    }
}

impl FromStr for CropPolicy {
    type Err = ParseParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "maintain_ratio" => Ok(CropPolicy::MaintainRatio),
            "force" => Ok(CropPolicy::Force),
            "at_least" => Ok(CropPolicy::AtLeast),
            "at_max" => Ok(CropPolicy::AtMax),
            _ => Err(ParseParamError::new("crop", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Focus {
    Center,
    Top,
    Bottom,
    Left,
    Right,
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl Focus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Focus::Center => "center",
            Focus::Top => "top",
            Focus::Bottom => "bottom",
            Focus::Left => "left",
            Focus::Right => "right",
            Focus::TopLeft => "top_left",
            Focus::TopRight => "top_right",
            Focus::BottomLeft => "bottom_left",
            Focus::BottomRight => "bottom_right",
        }
    }
}

impl FromStr for Focus {
    type Err = ParseParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "center" => Ok(Focus::Center),
            "top" => Ok(Focus::Top),
            "bottom" => Ok(Focus::Bottom),
            "left" => Ok(Focus::Left),
            "right" => Ok(Focus::Right),
            "top_left" => Ok(Focus::TopLeft),
            "top_right" => Ok(Focus::TopRight),
            "bottom_left" => Ok(Focus::BottomLeft),
            "bottom_right" => Ok(Focus::BottomRight),
            _ => Err(ParseParamError::new("focus", s)),
        }
    }
}

/// Width to height ratio, written `W:H` (e.g. `16:9`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AspectRatio {
    pub width: u32,
    pub height: u32,
}

impl AspectRatio {
    pub fn new(width: u32, height: u32) -> Option<Self> {
        if width == 0 || height == 0 {
            return None;
        }
        Some(Self { width, height })
    }

    /// Height matching `width` under this ratio, rounded to the nearest pixel.
    pub fn height_for(&self, width: u32) -> u32 {
        let height = (width as f64 * self.height as f64 / self.width as f64).round() as u32;
        height.max(1)
    }
}

impl FromStr for AspectRatio {
    type Err = ParseParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(':')
            .or_else(|| s.split_once('-'))
            .ok_or_else(|| ParseParamError::new("aspect ratio", s))?;
        let width = w.trim().parse().map_err(|_| ParseParamError::new("aspect ratio", s))?;
        let height = h.trim().parse().map_err(|_| ParseParamError::new("aspect ratio", s))?;
        AspectRatio::new(width, height).ok_or_else(|| ParseParamError::new("aspect ratio", s))
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.width, self.height)
    }
}

/// A logical image source: a path relative to the storage root or an
/// absolute URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    source: String,
    aspect_ratio: Option<AspectRatio>,
}

impl ImageReference {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            aspect_ratio: None,
        }
    }

    pub fn with_aspect_ratio(mut self, aspect_ratio: Option<AspectRatio>) -> Self {
        self.aspect_ratio = aspect_ratio;
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn aspect_ratio(&self) -> Option<AspectRatio> {
        self.aspect_ratio
    }

    pub fn is_absolute(&self) -> bool {
        self.source.starts_with("https://") || self.source.starts_with("http://")
    }

    /// Storage path without leading slashes, for relative sources.
    pub fn path(&self) -> &str {
        self.source.trim_start_matches('/')
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
pub struct TransformSpec {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub quality: Option<u8>,
    pub format: Option<ImageFormat>,
    pub crop: Option<CropPolicy>,
    pub focus: Option<Focus>,
    pub blur: Option<u8>,
}

impl TransformSpec {
    pub fn with_width(mut self, width: u32) -> Self {
        self.width = Some(width);
        self
    }

    pub fn with_height(mut self, height: u32) -> Self {
        self.height = Some(height);
        self
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn with_format(mut self, format: ImageFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_crop(mut self, crop: CropPolicy) -> Self {
        self.crop = Some(crop);
        self
    }

    pub fn with_focus(mut self, focus: Focus) -> Self {
        self.focus = Some(focus);
        self
    }

    pub fn with_blur(mut self, blur: u8) -> Self {
        self.blur = Some(blur);
        self
    }

    /// Check if any transformation is requested (i.e., if conversion is needed)
    pub fn needs_conversion(&self) -> bool {
        self.width.is_some()
            || self.height.is_some()
            || self.format.is_some()
            || self.quality.is_some()
            || self.crop.is_some()
            || self.focus.is_some()
            || self.blur.is_some()
    }

    /// Replace an unset or `auto` format with `negotiated`.
    pub fn resolve_format(mut self, negotiated: ImageFormat) -> Self {
        if matches!(self.format, None | Some(ImageFormat::Auto)) {
            self.format = Some(negotiated);
        }
        self
    }

    /// Stable fingerprint of a source and this spec, used as the
    /// optimization cache key.
    pub fn fingerprint(&self, source: &str) -> String {
        let mut context = md5::Context::new();
        context.consume(source.as_bytes());
        context.consume([0u8]);
        // Field order is fixed by the struct definition, so the encoding is stable.
        context.consume(serde_json::to_vec(self).unwrap_or_default());
        format!("{:x}", context.compute())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_format_aliases() {
        assert_eq!("jpeg".parse::<ImageFormat>(), Ok(ImageFormat::Jpg));
        assert_eq!("avif".parse::<ImageFormat>(), Ok(ImageFormat::Avif));
        assert!("gif".parse::<ImageFormat>().is_err());
    }

    #[test]
    fn parses_aspect_ratio() {
        let ratio: AspectRatio = "16:9".parse().unwrap();
        assert_eq!(ratio, AspectRatio { width: 16, height: 9 });
        assert_eq!(ratio.height_for(1600), 900);
        assert_eq!("4-3".parse::<AspectRatio>().unwrap().height_for(400), 300);
        assert!("0:9".parse::<AspectRatio>().is_err());
        assert!("wide".parse::<AspectRatio>().is_err());
    }

    #[test]
    fn fingerprint_depends_on_source_and_spec() {
        let spec = TransformSpec::default().with_width(400).with_format(ImageFormat::Webp);
        let a = spec.fingerprint("https://s3.example.com/b/hero.jpg");
        assert_eq!(a, spec.clone().fingerprint("https://s3.example.com/b/hero.jpg"));
        assert_ne!(a, spec.clone().with_quality(60).fingerprint("https://s3.example.com/b/hero.jpg"));
        assert_ne!(a, spec.fingerprint("https://s3.example.com/b/other.jpg"));
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn resolve_format_only_replaces_auto() {
        let spec = TransformSpec::default().with_format(ImageFormat::Png);
        assert_eq!(spec.resolve_format(ImageFormat::Avif).format, Some(ImageFormat::Png));

        let spec = TransformSpec::default().with_format(ImageFormat::Auto);
        assert_eq!(spec.resolve_format(ImageFormat::Webp).format, Some(ImageFormat::Webp));

        assert_eq!(
            TransformSpec::default().resolve_format(ImageFormat::Jpg).format,
            Some(ImageFormat::Jpg)
        );
    }

    #[test]
    fn relative_path_strips_leading_slashes() {
        let reference = ImageReference::new("/images/hero.jpg");
        assert!(!reference.is_absolute());
        assert_eq!(reference.path(), "images/hero.jpg");
        assert!(ImageReference::new("https://cdn.example.com/a.jpg").is_absolute());
    }
}
