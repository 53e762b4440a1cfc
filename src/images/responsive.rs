use serde::{Deserialize, Serialize};

use crate::images::failover::FailoverResolver;
use crate::images::types::{AspectRatio, CropPolicy, Focus, ImageFormat, ImageReference, TransformSpec};

pub const DEFAULT_SIZES: &str = "100vw";
pub const LQIP_WIDTH: u32 = 32;
pub const LQIP_QUALITY: u8 = 20;
pub const LQIP_BLUR: u8 = 10;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponsiveOptions {
    pub src: String,
    pub widths: Vec<u32>,
    pub sizes: Option<String>,
    pub base_width: Option<u32>,
    pub base_height: Option<u32>,
    pub quality: Option<u8>,
    pub format: Option<ImageFormat>,
    pub aspect_ratio: Option<AspectRatio>,
    pub focus: Option<Focus>,
    #[serde(default)]
    pub lqip: bool,
    /// Precomputed dominant color, used as placeholder when no LQIP is requested.
    pub placeholder_color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub url: String,
    pub width: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Placeholder {
    Url(String),
    Color(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponsiveAttributes {
    pub src: String,
    pub srcset: String,
    pub sizes: String,
    pub candidates: Vec<Candidate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lqip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<Placeholder>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Builds the responsive descriptor for one image.
///
/// Each width is resolved on its own; a width that cannot be resolved is
/// dropped rather than failing the batch. Candidates come out ascending by
/// width. An unset or `auto` format is replaced by `negotiated` when given.
pub fn get_responsive_image_attributes(
    resolver: &FailoverResolver,
    options: &ResponsiveOptions,
    negotiated: Option<ImageFormat>,
) -> ResponsiveAttributes {
    let aspect_ratio = options.aspect_ratio.or_else(|| match (options.base_width, options.base_height) {
        (Some(w), Some(h)) => AspectRatio::new(w, h),
        _ => None,
    });
    let reference = ImageReference::new(options.src.clone()).with_aspect_ratio(aspect_ratio);

    let format = match (options.format, negotiated) {
        (None, Some(negotiated)) | (Some(ImageFormat::Auto), Some(negotiated)) => Some(negotiated),
        (format, _) => format,
    };

    let base_spec = TransformSpec {
        quality: options.quality,
        format,
        focus: options.focus,
        ..TransformSpec::default()
    };

    let spec_for = |width: u32| -> TransformSpec {
        let mut spec = base_spec.clone().with_width(width);
        if let Some(ratio) = aspect_ratio {
            spec = spec.with_height(ratio.height_for(width)).with_crop(CropPolicy::MaintainRatio);
        }
        spec
    };

    let mut widths: Vec<u32> = options.widths.iter().copied().filter(|w| *w > 0).collect();
    widths.sort_unstable();
    widths.dedup();

    let candidates: Vec<Candidate> = widths
        .iter()
        .filter_map(|&width| match resolver.resolve(&reference, &spec_for(width)) {
            Ok(resolved) => Some(Candidate { url: resolved.url, width }),
            Err(e) => {
                log::warn!("Dropping {}w candidate: {}", width, e);
                None
            }
        })
        .collect();

    let srcset = candidates
        .iter()
        .map(|candidate| format!("{} {}w", candidate.url, candidate.width))
        .collect::<Vec<_>>()
        .join(", ");

    let width = options.base_width.or_else(|| widths.last().copied());
    let height = match (options.base_height, width, aspect_ratio) {
        (Some(h), _, _) => Some(h),
        (None, Some(w), Some(ratio)) => Some(ratio.height_for(w)),
        _ => None,
    };

    let src_spec = match width {
        Some(w) => spec_for(w),
        None => base_spec.clone(),
    };
    let src = resolver
        .get_image_with_failover(&reference, &src_spec)
        .map(|resolved| resolved.url)
        .unwrap_or_else(|_| options.src.clone());

    let lqip = if options.lqip {
        let spec = spec_for(LQIP_WIDTH).with_quality(LQIP_QUALITY).with_blur(LQIP_BLUR);
        match resolver.resolve(&reference, &spec) {
            Ok(resolved) => Some(resolved.url),
            Err(e) => {
                log::warn!("Dropping placeholder: {}", e);
                None
            }
        }
    } else {
        None
    };

    let placeholder = match (&lqip, &options.placeholder_color) {
        (Some(url), _) => Some(Placeholder::Url(url.clone())),
        (None, Some(color)) => Some(Placeholder::Color(color.clone())),
        (None, None) => None,
    };

    ResponsiveAttributes {
        src,
        srcset,
        sizes: options.sizes.clone().unwrap_or_else(|| DEFAULT_SIZES.to_string()),
        candidates,
        lqip,
        placeholder,
        width,
        height,
    }
}
